//! 实例、物理设备与逻辑设备的创建

use ash::extensions::{ext, khr};
use ash::vk;
use std::ffi::{c_void, CStr, CString};
use tracing::{debug, error, info, trace, warn};

use super::vk_error;
use crate::core::config::Config;
use crate::core::error::{DistRhiError, GraphicsError, Result};
use crate::queue::{QueueFamilyDesc, QueueLayout};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// 设备创建的全部产物
pub(super) struct DeviceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_utils: Option<ext::DebugUtils>,
    pub messenger: vk::DebugUtilsMessengerEXT,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub layout: QueueLayout,
    pub surface_extensions: Vec<&'static CStr>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "dist_rhi::vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "dist_rhi::vulkan", "{}", message);
    } else {
        trace!(target: "dist_rhi::vulkan", "{}", message);
    }
    vk::FALSE
}

/// 当前平台可用的表面扩展
fn surface_extensions(entry: &ash::Entry) -> Vec<&'static CStr> {
    let available: Vec<CString> = entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default()
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect();

    let mut wanted: Vec<&'static CStr> = vec![khr::Surface::name()];
    #[cfg(target_os = "windows")]
    wanted.push(khr::Win32Surface::name());
    #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
    {
        wanted.push(khr::XlibSurface::name());
        wanted.push(khr::XcbSurface::name());
        wanted.push(khr::WaylandSurface::name());
    }

    wanted
        .into_iter()
        .filter(|name| available.iter().any(|a| a.as_c_str() == *name))
        .collect()
}

fn create_instance(entry: &ash::Entry, validation: bool, extensions: &[&CStr]) -> Result<ash::Instance> {
    let app_name = CString::new("dist_rhi").map_err(|e| DistRhiError::Initialization(e.to_string()))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extension_ptrs: Vec<*const i8> = extensions.iter().map(|e| e.as_ptr()).collect();
    let mut layer_ptrs: Vec<*const i8> = Vec::new();
    if validation {
        extension_ptrs.push(ext::DebugUtils::name().as_ptr());
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let has_layer = layers
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if has_layer {
            layer_ptrs.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_ptrs);

    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| GraphicsError::DeviceCreation(format!("vkCreateInstance: {}", e)).into())
}

fn queue_families(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Vec<QueueFamilyDesc> {
    unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
        .iter()
        .enumerate()
        .map(|(index, props)| QueueFamilyDesc {
            index: index as u32,
            graphics: props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: props.queue_flags.contains(vk::QueueFlags::COMPUTE),
            // 图形 / 计算族隐含传输能力
            transfer: props
                .queue_flags
                .intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            queue_count: props.queue_count,
        })
        .collect()
}

/// 选择支持 Vulkan 1.3 的物理设备，独立显卡优先
fn pick_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(vk_error("vkEnumeratePhysicalDevices"))?;

    let score = |device: &vk::PhysicalDevice| {
        let props = unsafe { instance.get_physical_device_properties(*device) };
        if props.api_version < vk::API_VERSION_1_3 {
            return None;
        }
        Some(match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        })
    };

    devices
        .iter()
        .filter_map(|d| score(d).map(|s| (s, *d)))
        .max_by_key(|(s, _)| *s)
        .map(|(_, d)| d)
        .ok_or_else(|| GraphicsError::DeviceCreation("no Vulkan 1.3 capable device".into()).into())
}

impl DeviceContext {
    pub fn new(config: &Config) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| DistRhiError::Initialization(format!("failed to load the Vulkan loader: {}", e)))?;

        let validation = config.graphics.validation;
        let surface_extensions = surface_extensions(&entry);
        let instance = create_instance(&entry, validation, &surface_extensions)?;

        let (debug_utils, messenger) = if validation {
            let debug_utils = ext::DebugUtils::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe { debug_utils.create_debug_utils_messenger(&info, None) }
                .unwrap_or_else(|e| {
                    warn!("Failed to create debug messenger: {}", e);
                    vk::DebugUtilsMessengerEXT::null()
                });
            (Some(debug_utils), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        let physical_device = match pick_physical_device(&instance) {
            Ok(device) => device,
            Err(e) => {
                unsafe {
                    if let Some(debug_utils) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();
        info!(device = %device_name, api = format!(
            "{}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        ), "Vulkan physical device selected");

        let families = queue_families(&instance, physical_device);
        let layout = QueueLayout::select(&families, config.graphics.max_extra_graphics_queues)?;
        debug!(?layout, "Vulkan queue layout");

        let counts = layout.queue_counts();
        let priorities: Vec<Vec<f32>> = counts.iter().map(|(_, n)| vec![1.0; *n as usize]).collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = counts
            .iter()
            .zip(&priorities)
            .map(|((family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = match unsafe { instance.create_device(physical_device, &create_info, None) } {
            Ok(device) => device,
            Err(e) => {
                unsafe {
                    if let Some(debug_utils) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(GraphicsError::DeviceCreation(format!("vkCreateDevice: {}", e)).into());
            }
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            messenger,
            physical_device,
            device,
            layout,
            surface_extensions,
        })
    }

    /// 按创建的逆序销毁
    ///
    /// # Safety
    ///
    /// 所有从设备创建的对象都必须已经销毁
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_device(None);
        if let Some(debug_utils) = &self.debug_utils {
            if self.messenger != vk::DebugUtilsMessengerEXT::null() {
                debug_utils.destroy_debug_utils_messenger(self.messenger, None);
            }
        }
        self.instance.destroy_instance(None);
    }
}
