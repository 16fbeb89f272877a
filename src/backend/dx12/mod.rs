//! DirectX 12 后端（windows-rs）
//!
//! - 队列族是固定的三个：DIRECT（0）、COMPUTE（1）、COPY（2）
//! - 时间线信号量就是 `ID3D12Fence`；二值信号量不需要原生对象，
//!   DXGI 在呈现队列上自行排序获取与呈现
//! - 每个命令列表独占一个命令分配器；二级命令列表录制为 bundle，
//!   只能包含绘制、分发与绑定命令
//! - 每个缓冲区 / 纹理是一个提交资源（committed resource），上传 / 回读堆持久映射
//! - 描述符集是着色器可见堆中的连续区间；set N 的绑定 b 对应寄存器空间 N 中的 b / t / u / s
//! - 推送常量映射为根常量，寄存器为 `b0, space` [`PUSH_CONSTANT_SPACE`]

mod convert;
mod descriptor;
mod encoder;
mod pipeline;
mod swapchain;

pub use encoder::Dx12Encoder;
pub use pipeline::PUSH_CONSTANT_SPACE;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use self::descriptor::DescriptorHeap;
use self::pipeline::{IndirectKind, SetPlan};
use super::{
    AcquireResult, Backend, BufferWrite, CommandListLevel, EncodeContext, ImageWrite, PresentResult,
    SemaphoreKind, SubmitBatch, WaitStatus,
};
use crate::command::PipelineBindPoint;
use crate::core::config::Config;
use crate::core::error::{DistRhiError, GraphicsError, Result};
use crate::core::sync::lock;
use crate::queue::{NativeQueueSlot, QueueFamilyDesc, QueueLayout};
use crate::resource::{
    BufferDesc, BufferUsage, DescriptorBinding, DescriptorSetLayoutDesc, Format, MemoryLocation,
    PipelineLayoutDesc, SamplerDesc, TextureDesc, TextureDimension, TextureUsage,
};
use crate::shader::{CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ShaderStage, ShaderStages, ShaderTarget};
use crate::swapchain::SwapchainDesc;

const DIRECT_FAMILY: u32 = 0;
const COMPUTE_FAMILY: u32 = 1;
const COPY_FAMILY: u32 = 2;

const RTV_CAPACITY: u32 = 1024;
const DSV_CAPACITY: u32 = 256;
const VIEW_CAPACITY: u32 = 4096;
const SAMPLER_CAPACITY: u32 = 512;
const SHADER_VIEW_CAPACITY: u32 = 65536;
/// 着色器可见采样器堆的硬件上限
const SHADER_SAMPLER_CAPACITY: u32 = 2048;

/// 常量缓冲区视图的大小与偏移对齐
const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// 把 windows-rs 错误包装为带调用名的错误
pub(super) fn dx_error(call: &'static str) -> impl Fn(windows::core::Error) -> DistRhiError {
    move |e| GraphicsError::CommandExecution(format!("{} failed: {}", call, e)).into()
}

pub(super) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn set_name(resource: &ID3D12Resource, name: Option<&str>) {
    if let Some(name) = name {
        let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        let _ = unsafe { resource.SetName(PCWSTR(wide.as_ptr())) };
    }
}

fn list_type(family: u32) -> D3D12_COMMAND_LIST_TYPE {
    match family {
        COMPUTE_FAMILY => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        COPY_FAMILY => D3D12_COMMAND_LIST_TYPE_COPY,
        _ => D3D12_COMMAND_LIST_TYPE_DIRECT,
    }
}

/// DX12 的三个队列族；同类型队列可以任意创建，数量只按需要声明
fn queue_families(extra_graphics: u32) -> [QueueFamilyDesc; 3] {
    [
        QueueFamilyDesc {
            index: DIRECT_FAMILY,
            graphics: true,
            compute: true,
            transfer: true,
            queue_count: 1 + extra_graphics,
        },
        QueueFamilyDesc { index: COMPUTE_FAMILY, graphics: false, compute: true, transfer: true, queue_count: 1 },
        QueueFamilyDesc { index: COPY_FAMILY, graphics: false, compute: false, transfer: true, queue_count: 1 },
    ]
}

/// 持久映射的主机指针，读写由调用方保证不与 GPU 访问重叠
#[derive(Debug, Clone, Copy)]
struct MappedPtr(NonNull<u8>);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

macro_rules! com_wrapper {
    ($($name:ident),* $(,)?) => {
        // D3D12 对象是自由线程的
        $(
            unsafe impl Send for $name {}
            unsafe impl Sync for $name {}
        )*
    };
}

pub struct Dx12Queue {
    raw: ID3D12CommandQueue,
    family: u32,
}

pub struct Dx12Semaphore {
    /// 二值信号量为 `None`
    fence: Option<ID3D12Fence>,
}

pub struct Dx12Buffer {
    raw: ID3D12Resource,
    size: u64,
    location: MemoryLocation,
    gpu_address: u64,
    mapped: Option<MappedPtr>,
}

pub struct Dx12Texture {
    raw: ID3D12Resource,
    format: Format,
    mip_levels: u32,
    array_layers: u32,
    rtv: Option<u32>,
    dsv: Option<u32>,
    srv: Option<u32>,
    uav: Option<u32>,
}

pub struct Dx12Sampler {
    index: u32,
}

pub struct Dx12Shader {
    stages: Vec<(ShaderStage, Vec<u8>)>,
}

pub struct Dx12PipelineLayout {
    root_signature: ID3D12RootSignature,
    sets: Vec<SetPlan>,
    /// (根参数下标, 阶段)
    push_constants: Option<(u32, ShaderStages)>,
}

pub struct Dx12Pipeline {
    raw: ID3D12PipelineState,
    root_signature: ID3D12RootSignature,
    bind_point: PipelineBindPoint,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    /// (顶点缓冲绑定点, 步长)
    vertex_strides: Vec<(u32, u32)>,
}

pub struct Dx12DescriptorSet {
    plan: SetPlan,
    resource_start: Option<u32>,
    sampler_start: Option<u32>,
}

pub struct Dx12CommandList {
    allocator: ID3D12CommandAllocator,
    raw: ID3D12GraphicsCommandList,
    ty: D3D12_COMMAND_LIST_TYPE,
}

pub struct Dx12Swapchain {
    raw: IDXGISwapChain3,
    images: Vec<ID3D12Resource>,
    rtvs: Vec<u32>,
    rtv_format: DXGI_FORMAT,
    width: u32,
    height: u32,
    vsync: bool,
    image_count: u32,
}

com_wrapper!(
    Dx12Queue,
    Dx12Semaphore,
    Dx12Buffer,
    Dx12Texture,
    Dx12PipelineLayout,
    Dx12Pipeline,
    Dx12CommandList,
    Dx12Swapchain,
);

/// DirectX 12 后端
pub struct Dx12Backend {
    factory: IDXGIFactory4,
    device: ID3D12Device,
    layout: QueueLayout,
    rtv_heap: DescriptorHeap,
    dsv_heap: DescriptorHeap,
    /// 纹理 SRV / UAV 的 CPU 描述符
    view_heap: DescriptorHeap,
    sampler_heap: DescriptorHeap,
    shader_view_heap: DescriptorHeap,
    shader_sampler_heap: DescriptorHeap,
    command_signatures: Mutex<Vec<(IndirectKind, u32, ID3D12CommandSignature)>>,
}

com_wrapper!(Dx12Backend);

impl Dx12Backend {
    fn host_range(buffer: &Dx12Buffer, offset: u64, len: usize) -> Result<MappedPtr> {
        let mapped = buffer
            .mapped
            .ok_or_else(|| DistRhiError::Runtime("buffer is not host visible".into()))?;
        if offset.saturating_add(len as u64) > buffer.size {
            return Err(DistRhiError::Runtime(format!(
                "host access of {} bytes at offset {} exceeds buffer size {}",
                len, offset, buffer.size
            )));
        }
        Ok(mapped)
    }

    /// 间接命令签名，按种类与步长缓存
    fn command_signature(&self, kind: IndirectKind, stride: u32) -> Result<ID3D12CommandSignature> {
        let stride = if stride == 0 { kind.natural_stride() } else { stride };
        let mut cache = lock(&self.command_signatures);
        if let Some((_, _, signature)) = cache.iter().find(|(k, s, _)| *k == kind && *s == stride) {
            return Ok(signature.clone());
        }
        let signature = pipeline::create_command_signature(&self.device, kind, stride)?;
        cache.push((kind, stride, signature.clone()));
        Ok(signature)
    }

    fn pick_adapter(factory: &IDXGIFactory4) -> Result<(ID3D12Device, String)> {
        let mut fallback = None;
        for i in 0.. {
            let adapter = match unsafe { factory.EnumAdapters1(i) } {
                Ok(adapter) => adapter,
                Err(_) => break,
            };
            let desc = unsafe { adapter.GetDesc1() }.map_err(dx_error("IDXGIAdapter1::GetDesc1"))?;
            let name = String::from_utf16_lossy(&desc.Description)
                .trim_end_matches('\0')
                .to_string();
            let software = desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0;

            let mut device: Option<ID3D12Device> = None;
            if unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device) }.is_err() {
                debug!(adapter = %name, "Adapter does not support feature level 12_0");
                continue;
            }
            let Some(device) = device else {
                continue;
            };
            if !software {
                return Ok((device, name));
            }
            fallback.get_or_insert((device, name));
        }
        fallback.ok_or_else(|| GraphicsError::DeviceCreation("no D3D12 capable adapter found".into()).into())
    }

    fn create_view_descriptors(&self, raw: &ID3D12Resource, desc: &TextureDesc) -> Result<ViewIndices> {
        let mut views = ViewIndices::default();
        let result = (|| -> Result<()> {
            unsafe {
                if desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
                    let index = self.rtv_heap.allocate(1)?;
                    views.rtv = Some(index);
                    self.device.CreateRenderTargetView(raw, None, self.rtv_heap.cpu_handle(index));
                }
                if desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
                    let index = self.dsv_heap.allocate(1)?;
                    views.dsv = Some(index);
                    let dsv = D3D12_DEPTH_STENCIL_VIEW_DESC {
                        Format: convert::format(desc.format),
                        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                        Flags: D3D12_DSV_FLAG_NONE,
                        Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 { Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 } },
                    };
                    self.device.CreateDepthStencilView(raw, Some(&dsv), self.dsv_heap.cpu_handle(index));
                }
                if desc.usage.contains(TextureUsage::SAMPLED) {
                    let index = self.view_heap.allocate(1)?;
                    views.srv = Some(index);
                    let srv = pipeline::srv_desc(desc);
                    self.device.CreateShaderResourceView(raw, Some(&srv), self.view_heap.cpu_handle(index));
                }
                if desc.usage.contains(TextureUsage::STORAGE) {
                    let index = self.view_heap.allocate(1)?;
                    views.uav = Some(index);
                    self.device.CreateUnorderedAccessView(
                        raw,
                        None::<&ID3D12Resource>,
                        None,
                        self.view_heap.cpu_handle(index),
                    );
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(views),
            Err(e) => {
                self.free_view_descriptors(&views);
                Err(e)
            }
        }
    }

    fn free_view_descriptors(&self, views: &ViewIndices) {
        if let Some(index) = views.rtv {
            self.rtv_heap.free(index, 1);
        }
        if let Some(index) = views.dsv {
            self.dsv_heap.free(index, 1);
        }
        for index in [views.srv, views.uav].into_iter().flatten() {
            self.view_heap.free(index, 1);
        }
    }
}

#[derive(Default)]
struct ViewIndices {
    rtv: Option<u32>,
    dsv: Option<u32>,
    srv: Option<u32>,
    uav: Option<u32>,
}

impl Backend for Dx12Backend {
    type Queue = Dx12Queue;
    type Semaphore = Dx12Semaphore;
    type Buffer = Dx12Buffer;
    type Texture = Dx12Texture;
    type Sampler = Dx12Sampler;
    type Shader = Dx12Shader;
    type PipelineLayout = Dx12PipelineLayout;
    type Pipeline = Dx12Pipeline;
    type DescriptorSet = Dx12DescriptorSet;
    type CommandList = Dx12CommandList;
    type Swapchain = Dx12Swapchain;
    type Encoder<'a> = Dx12Encoder<'a>;

    const NAME: &'static str = "DirectX 12";
    const SHADER_TARGET: ShaderTarget = ShaderTarget::Dxil;

    fn new(config: &Config) -> Result<Self> {
        unsafe {
            if config.graphics.validation {
                let mut debug: Option<ID3D12Debug> = None;
                match (D3D12GetDebugInterface(&mut debug), debug) {
                    (Ok(()), Some(debug)) => {
                        debug.EnableDebugLayer();
                        debug!("DX12 debug layer enabled");
                    }
                    _ => warn!("Failed to enable DX12 debug layer"),
                }
            }

            let flags = if config.graphics.validation {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };
            let factory: IDXGIFactory4 = CreateDXGIFactory2(flags)
                .map_err(|e| GraphicsError::DeviceCreation(format!("CreateDXGIFactory2 failed: {}", e)))?;
            let (device, adapter) = Self::pick_adapter(&factory)?;

            let layout = QueueLayout::select(
                &queue_families(config.graphics.max_extra_graphics_queues),
                config.graphics.max_extra_graphics_queues,
            )?;

            let backend = Self {
                rtv_heap: DescriptorHeap::new(&device, D3D12_DESCRIPTOR_HEAP_TYPE_RTV, RTV_CAPACITY, false, "rtv")?,
                dsv_heap: DescriptorHeap::new(&device, D3D12_DESCRIPTOR_HEAP_TYPE_DSV, DSV_CAPACITY, false, "dsv")?,
                view_heap: DescriptorHeap::new(
                    &device,
                    D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    VIEW_CAPACITY,
                    false,
                    "texture views",
                )?,
                sampler_heap: DescriptorHeap::new(
                    &device,
                    D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
                    SAMPLER_CAPACITY,
                    false,
                    "samplers",
                )?,
                shader_view_heap: DescriptorHeap::new(
                    &device,
                    D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    SHADER_VIEW_CAPACITY,
                    true,
                    "descriptor sets",
                )?,
                shader_sampler_heap: DescriptorHeap::new(
                    &device,
                    D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
                    SHADER_SAMPLER_CAPACITY,
                    true,
                    "descriptor set samplers",
                )?,
                command_signatures: Mutex::new(Vec::new()),
                factory,
                device,
                layout,
            };

            info!(adapter = %adapter, validation = config.graphics.validation, "DX12 backend initialized");
            Ok(backend)
        }
    }

    fn queue_layout(&self) -> &QueueLayout {
        &self.layout
    }

    fn native_queue(&self, slot: NativeQueueSlot) -> Result<Dx12Queue> {
        if !self.layout.unique_slots().contains(&slot) {
            return Err(GraphicsError::DeviceCreation(format!("queue {:?} was not requested", slot)).into());
        }
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: list_type(slot.family),
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        let raw: ID3D12CommandQueue =
            unsafe { self.device.CreateCommandQueue(&desc) }.map_err(dx_error("CreateCommandQueue"))?;
        Ok(Dx12Queue { raw, family: slot.family })
    }

    fn wait_idle(&self) -> Result<()> {
        // 设备没有整体等待接口，由 Device 等待各队列的时间线信号量
        Ok(())
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<Dx12Semaphore> {
        match kind {
            SemaphoreKind::Timeline { initial } => {
                let fence: ID3D12Fence = unsafe { self.device.CreateFence(initial, D3D12_FENCE_FLAG_NONE) }
                    .map_err(dx_error("CreateFence"))?;
                Ok(Dx12Semaphore { fence: Some(fence) })
            }
            SemaphoreKind::Binary => Ok(Dx12Semaphore { fence: None }),
        }
    }

    fn destroy_semaphore(&self, _semaphore: Dx12Semaphore) {}

    fn semaphore_value(&self, semaphore: &Dx12Semaphore) -> Result<u64> {
        let fence = semaphore
            .fence
            .as_ref()
            .ok_or_else(|| DistRhiError::Runtime("binary semaphores have no counter value".into()))?;
        Ok(unsafe { fence.GetCompletedValue() })
    }

    fn signal_semaphore(&self, semaphore: &Dx12Semaphore, value: u64) -> Result<()> {
        match &semaphore.fence {
            Some(fence) => unsafe { fence.Signal(value) }.map_err(dx_error("ID3D12Fence::Signal")),
            None => Ok(()),
        }
    }

    fn wait_semaphores(&self, waits: &[(&Dx12Semaphore, u64)], timeout: Duration) -> Result<WaitStatus> {
        let pending: Vec<(&ID3D12Fence, u64)> = waits
            .iter()
            .filter_map(|(s, v)| s.fence.as_ref().map(|f| (f, *v)))
            .filter(|(f, v)| unsafe { f.GetCompletedValue() } < *v)
            .collect();
        if pending.is_empty() {
            return Ok(WaitStatus::Ready);
        }

        let deadline = Instant::now().checked_add(timeout);
        let event = unsafe { CreateEventA(None, false, false, None) }.map_err(dx_error("CreateEventA"))?;
        let result = pending.iter().try_fold(WaitStatus::Ready, |status, (fence, value)| {
            if status == WaitStatus::Timeout {
                return Ok(status);
            }
            unsafe { fence.SetEventOnCompletion(*value, event) }.map_err(dx_error("SetEventOnCompletion"))?;
            let millis = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    u32::try_from(remaining.as_millis()).unwrap_or(INFINITE - 1)
                }
                None => INFINITE,
            };
            let signaled = unsafe { WaitForSingleObject(event, millis) } == WAIT_OBJECT_0;
            Ok(if signaled || unsafe { fence.GetCompletedValue() } >= *value {
                WaitStatus::Ready
            } else {
                WaitStatus::Timeout
            })
        });
        let _ = unsafe { CloseHandle(event) };
        result
    }

    fn submit(&self, queue: &Dx12Queue, batch: &SubmitBatch<'_, Self>) -> Result<()> {
        unsafe {
            for wait in &batch.waits {
                if let Some(fence) = &wait.semaphore.fence {
                    queue.raw.Wait(fence, wait.value).map_err(dx_error("ID3D12CommandQueue::Wait"))?;
                }
            }

            if !batch.command_lists.is_empty() {
                let lists: Vec<Option<ID3D12CommandList>> =
                    batch.command_lists.iter().map(|list| Some(list.raw.clone().into())).collect();
                queue.raw.ExecuteCommandLists(&lists);
            }

            for signal in &batch.signals {
                if let Some(fence) = &signal.semaphore.fence {
                    queue.raw.Signal(fence, signal.value).map_err(dx_error("ID3D12CommandQueue::Signal"))?;
                }
            }
        }
        Ok(())
    }

    fn create_command_list(&self, family: u32, level: CommandListLevel) -> Result<Dx12CommandList> {
        let ty = match level {
            CommandListLevel::Primary => list_type(family),
            CommandListLevel::Secondary => D3D12_COMMAND_LIST_TYPE_BUNDLE,
        };
        unsafe {
            let allocator: ID3D12CommandAllocator =
                self.device.CreateCommandAllocator(ty).map_err(dx_error("CreateCommandAllocator"))?;
            let raw: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, ty, &allocator, None::<&ID3D12PipelineState>)
                .map_err(dx_error("CreateCommandList"))?;
            // 新建的命令列表处于录制状态
            raw.Close().map_err(dx_error("ID3D12GraphicsCommandList::Close"))?;
            Ok(Dx12CommandList { allocator, raw, ty })
        }
    }

    fn destroy_command_list(&self, _list: Dx12CommandList) {}

    fn begin_encoding<'a>(
        &'a self,
        list: &'a mut Dx12CommandList,
        ctx: EncodeContext<'a, Self>,
    ) -> Result<Dx12Encoder<'a>> {
        unsafe {
            list.allocator.Reset().map_err(dx_error("ID3D12CommandAllocator::Reset"))?;
            list.raw
                .Reset(&list.allocator, None::<&ID3D12PipelineState>)
                .map_err(dx_error("ID3D12GraphicsCommandList::Reset"))?;
            if list.ty != D3D12_COMMAND_LIST_TYPE_COPY {
                list.raw.SetDescriptorHeaps(&[
                    Some(self.shader_view_heap.raw().clone()),
                    Some(self.shader_sampler_heap.raw().clone()),
                ]);
            }
        }
        Ok(Dx12Encoder::new(self, &list.raw, list.ty, ctx))
    }

    fn end_encoding<'a>(&'a self, encoder: Dx12Encoder<'a>) -> Result<Vec<Dx12Buffer>> {
        encoder.finish()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Dx12Buffer> {
        let (heap_type, state) = match desc.memory {
            MemoryLocation::GpuOnly => (D3D12_HEAP_TYPE_DEFAULT, D3D12_RESOURCE_STATE_COMMON),
            MemoryLocation::CpuToGpu => (D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ),
            MemoryLocation::GpuToCpu => (D3D12_HEAP_TYPE_READBACK, D3D12_RESOURCE_STATE_COPY_DEST),
        };
        let flags = if desc.usage.contains(BufferUsage::STORAGE) && desc.memory == MemoryLocation::GpuOnly {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };
        let heap_props = D3D12_HEAP_PROPERTIES { Type: heap_type, ..Default::default() };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            // 常量缓冲区视图按 256 字节取整，资源本身也取整，避免视图越界
            Width: align_up(desc.size.max(1), CONSTANT_BUFFER_ALIGNMENT),
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        };

        unsafe {
            let mut raw: Option<ID3D12Resource> = None;
            self.device
                .CreateCommittedResource(&heap_props, D3D12_HEAP_FLAG_NONE, &resource_desc, state, None, &mut raw)
                .map_err(|e| GraphicsError::ResourceCreation(format!("buffer ({} bytes): {}", desc.size, e)))?;
            let raw = raw.ok_or_else(|| GraphicsError::ResourceCreation("CreateCommittedResource returned null".into()))?;

            let mapped = if desc.memory.is_host_visible() {
                let mut ptr: *mut c_void = std::ptr::null_mut();
                raw.Map(0, None, Some(&mut ptr)).map_err(dx_error("ID3D12Resource::Map"))?;
                Some(MappedPtr(
                    NonNull::new(ptr.cast::<u8>())
                        .ok_or_else(|| GraphicsError::ResourceCreation("Map returned null".into()))?,
                ))
            } else {
                None
            };

            set_name(&raw, desc.name.as_deref());
            Ok(Dx12Buffer {
                gpu_address: raw.GetGPUVirtualAddress(),
                raw,
                size: desc.size,
                location: desc.memory,
                mapped,
            })
        }
    }

    fn destroy_buffer(&self, buffer: Dx12Buffer) {
        if buffer.mapped.is_some() {
            unsafe { buffer.raw.Unmap(0, None) };
        }
    }

    fn write_buffer(&self, buffer: &Dx12Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mapped = Self::host_range(buffer, offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.0.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &Dx12Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let mapped = Self::host_range(buffer, offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.0.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Dx12Texture> {
        let (dimension, depth_or_array) = match desc.dimension {
            TextureDimension::D2 => (D3D12_RESOURCE_DIMENSION_TEXTURE2D, desc.array_layers.max(1)),
            TextureDimension::D3 => (D3D12_RESOURCE_DIMENSION_TEXTURE3D, desc.depth.max(1)),
            TextureDimension::Cube => (D3D12_RESOURCE_DIMENSION_TEXTURE2D, desc.array_layers.max(6)),
        };

        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        if desc.usage.contains(TextureUsage::DEPTH_STENCIL) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        }
        if desc.usage.contains(TextureUsage::STORAGE) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
        }

        // 既做深度附件又要采样的纹理使用无类型格式，视图各自指定格式
        let format = if desc.format.is_depth() && desc.usage.contains(TextureUsage::SAMPLED) {
            convert::typeless(desc.format)
        } else {
            convert::format(desc.format)
        };
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: dimension,
            Alignment: 0,
            Width: u64::from(desc.width.max(1)),
            Height: desc.height.max(1),
            DepthOrArraySize: depth_or_array as u16,
            MipLevels: desc.mip_levels.max(1) as u16,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        };
        let clear_value = desc.format.is_depth().then(|| D3D12_CLEAR_VALUE {
            Format: convert::format(desc.format),
            Anonymous: D3D12_CLEAR_VALUE_0 {
                DepthStencil: D3D12_DEPTH_STENCIL_VALUE { Depth: 1.0, Stencil: 0 },
            },
        });
        let heap_props = D3D12_HEAP_PROPERTIES { Type: D3D12_HEAP_TYPE_DEFAULT, ..Default::default() };

        let raw = unsafe {
            let mut raw: Option<ID3D12Resource> = None;
            self.device
                .CreateCommittedResource(
                    &heap_props,
                    D3D12_HEAP_FLAG_NONE,
                    &resource_desc,
                    D3D12_RESOURCE_STATE_COMMON,
                    clear_value.as_ref().map(|v| v as *const _),
                    &mut raw,
                )
                .map_err(|e| {
                    GraphicsError::ResourceCreation(format!("texture {}x{}: {}", desc.width, desc.height, e))
                })?;
            raw.ok_or_else(|| GraphicsError::ResourceCreation("CreateCommittedResource returned null".into()))?
        };

        let views = self.create_view_descriptors(&raw, desc)?;
        set_name(&raw, desc.name.as_deref());
        Ok(Dx12Texture {
            raw,
            format: desc.format,
            mip_levels: desc.mip_levels.max(1),
            array_layers: depth_or_array,
            rtv: views.rtv,
            dsv: views.dsv,
            srv: views.srv,
            uav: views.uav,
        })
    }

    fn destroy_texture(&self, texture: Dx12Texture) {
        self.free_view_descriptors(&ViewIndices {
            rtv: texture.rtv,
            dsv: texture.dsv,
            srv: texture.srv,
            uav: texture.uav,
        });
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Dx12Sampler> {
        let index = self.sampler_heap.allocate(1)?;
        let sampler = D3D12_SAMPLER_DESC {
            Filter: convert::filter(
                desc.min_filter,
                desc.mag_filter,
                desc.mip_filter,
                desc.max_anisotropy.is_some(),
                desc.compare.is_some(),
            ),
            AddressU: convert::address_mode(desc.address_u),
            AddressV: convert::address_mode(desc.address_v),
            AddressW: convert::address_mode(desc.address_w),
            MipLODBias: 0.0,
            MaxAnisotropy: desc.max_anisotropy.map_or(1, |a| a.clamp(1.0, 16.0) as u32),
            ComparisonFunc: desc.compare.map(convert::compare).unwrap_or(D3D12_COMPARISON_FUNC_NEVER),
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        unsafe { self.device.CreateSampler(&sampler, self.sampler_heap.cpu_handle(index)) };
        Ok(Dx12Sampler { index })
    }

    fn destroy_sampler(&self, sampler: Dx12Sampler) {
        self.sampler_heap.free(sampler.index, 1);
    }

    fn create_shader(&self, shader: &CompiledShader) -> Result<Dx12Shader> {
        if shader.stages.iter().any(|s| s.code.is_empty()) {
            return Err(GraphicsError::ShaderCompilation("empty DXIL stage".into()).into());
        }
        Ok(Dx12Shader {
            stages: shader.stages.iter().map(|s| (s.stage, s.code.clone())).collect(),
        })
    }

    fn destroy_shader(&self, _shader: Dx12Shader) {}

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<Dx12PipelineLayout> {
        pipeline::create_pipeline_layout(&self.device, desc)
    }

    fn destroy_pipeline_layout(&self, _layout: Dx12PipelineLayout) {}

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        shader: &Dx12Shader,
        shader_info: &CompiledShader,
        layout: &Dx12PipelineLayout,
    ) -> Result<Dx12Pipeline> {
        pipeline::create_graphics_pipeline(&self.device, desc, shader, shader_info, layout)
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
        shader: &Dx12Shader,
        _shader_info: &CompiledShader,
        layout: &Dx12PipelineLayout,
    ) -> Result<Dx12Pipeline> {
        pipeline::create_compute_pipeline(&self.device, shader, layout)
    }

    fn destroy_pipeline(&self, _pipeline: Dx12Pipeline) {}

    fn create_descriptor_set(
        &self,
        layout: &Dx12PipelineLayout,
        set_index: u32,
        _desc: &DescriptorSetLayoutDesc,
    ) -> Result<Dx12DescriptorSet> {
        let plan = layout
            .sets
            .get(set_index as usize)
            .cloned()
            .ok_or_else(|| GraphicsError::ResourceCreation(format!("pipeline layout has no set {}", set_index)))?;

        let resource_start = match plan.resource_count {
            0 => None,
            n => Some(self.shader_view_heap.allocate(n)?),
        };
        let sampler_start = match plan.sampler_count {
            0 => None,
            n => match self.shader_sampler_heap.allocate(n) {
                Ok(start) => Some(start),
                Err(e) => {
                    if let Some(start) = resource_start {
                        self.shader_view_heap.free(start, plan.resource_count);
                    }
                    return Err(e);
                }
            },
        };
        Ok(Dx12DescriptorSet { plan, resource_start, sampler_start })
    }

    fn destroy_descriptor_set(&self, set: Dx12DescriptorSet) {
        if let Some(start) = set.resource_start {
            self.shader_view_heap.free(start, set.plan.resource_count);
        }
        if let Some(start) = set.sampler_start {
            self.shader_sampler_heap.free(start, set.plan.sampler_count);
        }
    }

    fn write_descriptor_buffers(
        &self,
        set: &Dx12DescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[BufferWrite<'_, Self>],
    ) {
        pipeline::write_buffers(self, set, binding, first_element, writes);
    }

    fn write_descriptor_images(
        &self,
        set: &Dx12DescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[ImageWrite<'_, Self>],
    ) {
        pipeline::write_images(self, set, binding, first_element, writes);
    }

    fn create_swapchain(
        &self,
        window: RawWindowHandle,
        _display: RawDisplayHandle,
        desc: &SwapchainDesc,
        present_queue: &Dx12Queue,
    ) -> Result<Dx12Swapchain> {
        swapchain::create(self, window, desc, present_queue)
    }

    fn resize_swapchain(&self, swapchain: &mut Dx12Swapchain, width: u32, height: u32) -> Result<()> {
        swapchain::resize(self, swapchain, width, height)
    }

    fn destroy_swapchain(&self, swapchain: Dx12Swapchain) {
        for index in &swapchain.rtvs {
            self.rtv_heap.free(*index, 1);
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: &mut Dx12Swapchain,
        _signal: &Dx12Semaphore,
        _timeout: Duration,
    ) -> Result<AcquireResult> {
        Ok(AcquireResult::Acquired(unsafe { swapchain.raw.GetCurrentBackBufferIndex() }))
    }

    fn present(
        &self,
        _queue: &Dx12Queue,
        swapchain: &Dx12Swapchain,
        _image: u32,
        _waits: &[&Dx12Semaphore],
    ) -> Result<PresentResult> {
        swapchain::present(swapchain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_families_select_dedicated_queues() {
        let layout = QueueLayout::select(&queue_families(2), 2).unwrap();
        assert_eq!(layout.graphics.family, DIRECT_FAMILY);
        assert_eq!(layout.transfer.family, COPY_FAMILY);
        assert_eq!(layout.compute.family, COMPUTE_FAMILY);
        assert_eq!(layout.capabilities.extra_graphics_queues, 2);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
