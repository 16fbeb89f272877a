//! 资源的创建、销毁与描述符更新

use tracing::{debug, error};

use super::tables::{
    BufferEntry, DescriptorSetEntry, PipelineEntry, PipelineLayoutEntry, ShaderEntry, TextureEntry,
};
use super::Device;
use crate::backend::{Backend, BufferWrite, ImageWrite};
use crate::command::PipelineBindPoint;
use crate::core::error::{DescriptorUpdateError, GraphicsError, Result};
use crate::core::sync::lock;
use crate::handle::{
    BufferHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle, SamplerHandle, ShaderHandle,
    TextureHandle,
};
use crate::resource::{
    BufferBinding, BufferDesc, DescriptorSetState, DescriptorType, DescriptorUpdateKind, ImageBinding,
    PipelineLayoutDesc, SamplerDesc, TextureDesc,
};
use crate::shader::{
    CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ReflectionLayout, ShaderCompiler, ShaderDesc,
};

fn invalid(what: &str) -> GraphicsError {
    GraphicsError::InvalidHandle(what.to_string())
}

impl<B: Backend> Device<B> {
    // ---- 缓冲区 ----

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            error!(name = ?desc.name, "Refusing to create a zero-sized buffer");
            return Err(GraphicsError::ResourceCreation("buffer size must be greater than 0".into()).into());
        }

        let _guard = self.creation_guard();
        let native = self.backend.create_buffer(desc)?;
        let handle = lock(&self.resources).buffers.add(BufferEntry { native, desc: desc.clone() });
        debug!(?handle, size = desc.size, name = ?desc.name, "Buffer created");
        Ok(handle)
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).buffers.remove(handle) {
            Some(entry) => self.backend.destroy_buffer(entry.native),
            None => error!(?handle, "Destroying an invalid buffer handle"),
        }
    }

    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        lock(&self.resources).buffers.get(handle).map(|e| e.desc.clone())
    }

    /// 写入 CPU 可见的缓冲区
    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let resources = lock(&self.resources);
        let entry = resources.buffers.get(handle).ok_or_else(|| invalid("buffer"))?;
        check_host_range(&entry.desc, offset, data.len())?;
        self.backend.write_buffer(&entry.native, offset, data)
    }

    /// 读取 CPU 可见的缓冲区
    pub fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let resources = lock(&self.resources);
        let entry = resources.buffers.get(handle).ok_or_else(|| invalid("buffer"))?;
        check_host_range(&entry.desc, offset, out.len())?;
        self.backend.read_buffer(&entry.native, offset, out)
    }

    // ---- 纹理与采样器 ----

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            error!(name = ?desc.name, "Refusing to create a texture with a zero dimension");
            return Err(GraphicsError::ResourceCreation("texture dimensions must be greater than 0".into()).into());
        }

        let _guard = self.creation_guard();
        let native = self.backend.create_texture(desc)?;
        let handle = lock(&self.resources)
            .textures
            .add(TextureEntry::Native { native, desc: desc.clone() });
        debug!(?handle, width = desc.width, height = desc.height, format = ?desc.format, "Texture created");
        Ok(handle)
    }

    pub fn destroy_texture(&self, handle: TextureHandle) {
        let _guard = self.creation_guard();
        let mut resources = lock(&self.resources);
        if let Some(TextureEntry::Swapchain(swapchain)) = resources.textures.get(handle) {
            error!(?handle, ?swapchain, "Swapchain textures are destroyed with their swapchain");
            return;
        }
        match resources.textures.remove(handle) {
            Some(TextureEntry::Native { native, .. }) => self.backend.destroy_texture(native),
            Some(TextureEntry::Swapchain(_)) => {}
            None => error!(?handle, "Destroying an invalid texture handle"),
        }
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let _guard = self.creation_guard();
        let native = self.backend.create_sampler(desc)?;
        Ok(lock(&self.resources).samplers.add(native))
    }

    pub fn destroy_sampler(&self, handle: SamplerHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).samplers.remove(handle) {
            Some(native) => self.backend.destroy_sampler(native),
            None => error!(?handle, "Destroying an invalid sampler handle"),
        }
    }

    // ---- 着色器与管线 ----

    /// 用外部编译服务编译着色器，并创建原生着色器对象
    pub fn compile_shader(&self, compiler: &dyn ShaderCompiler, desc: &ShaderDesc) -> Result<ShaderHandle> {
        let compiled = compiler.compile(desc, B::SHADER_TARGET).map_err(|e| {
            error!(shader = %desc.name, "Shader compilation failed: {}", e);
            e
        })?;
        self.create_shader(compiled)
    }

    /// 从已经编译好的二进制创建着色器
    pub fn create_shader(&self, compiled: CompiledShader) -> Result<ShaderHandle> {
        if compiled.stages.is_empty() {
            return Err(GraphicsError::ShaderCompilation("shader has no stages".into()).into());
        }

        let _guard = self.creation_guard();
        let native = self.backend.create_shader(&compiled)?;
        Ok(lock(&self.resources).shaders.add(ShaderEntry { native, compiled }))
    }

    pub fn destroy_shader(&self, handle: ShaderHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).shaders.remove(handle) {
            Some(entry) => self.backend.destroy_shader(entry.native),
            None => error!(?handle, "Destroying an invalid shader handle"),
        }
    }

    pub fn shader_reflection(&self, handle: ShaderHandle) -> Option<ReflectionLayout> {
        lock(&self.resources)
            .shaders
            .get(handle)
            .map(|e| e.compiled.reflection.clone())
    }

    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle> {
        let _guard = self.creation_guard();
        let native = self.backend.create_pipeline_layout(desc)?;
        Ok(lock(&self.resources)
            .pipeline_layouts
            .add(PipelineLayoutEntry { native, desc: desc.clone() }))
    }

    /// 直接使用着色器反射得到的布局创建管线布局
    pub fn create_pipeline_layout_from_shader(&self, shader: ShaderHandle) -> Result<PipelineLayoutHandle> {
        let reflection = self.shader_reflection(shader).ok_or_else(|| invalid("shader"))?;
        self.create_pipeline_layout(&reflection.pipeline_layout())
    }

    pub fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).pipeline_layouts.remove(handle) {
            Some(entry) => self.backend.destroy_pipeline_layout(entry.native),
            None => error!(?handle, "Destroying an invalid pipeline layout handle"),
        }
    }

    pub fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle> {
        let _guard = self.creation_guard();
        let mut resources = lock(&self.resources);
        let shader = resources.shaders.get(desc.shader).ok_or_else(|| invalid("shader"))?;
        let layout = resources.pipeline_layouts.get(desc.layout).ok_or_else(|| invalid("pipeline layout"))?;
        let native = self
            .backend
            .create_graphics_pipeline(desc, &shader.native, &shader.compiled, &layout.native)?;
        Ok(resources.pipelines.add(PipelineEntry { native, bind_point: PipelineBindPoint::Graphics }))
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        let _guard = self.creation_guard();
        let mut resources = lock(&self.resources);
        let shader = resources.shaders.get(desc.shader).ok_or_else(|| invalid("shader"))?;
        let layout = resources.pipeline_layouts.get(desc.layout).ok_or_else(|| invalid("pipeline layout"))?;
        let native = self
            .backend
            .create_compute_pipeline(desc, &shader.native, &shader.compiled, &layout.native)?;
        Ok(resources.pipelines.add(PipelineEntry { native, bind_point: PipelineBindPoint::Compute }))
    }

    pub fn destroy_pipeline(&self, handle: PipelineHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).pipelines.remove(handle) {
            Some(entry) => self.backend.destroy_pipeline(entry.native),
            None => error!(?handle, "Destroying an invalid pipeline handle"),
        }
    }

    // ---- 描述符集 ----

    /// 按管线布局中第 `set_index` 个描述符集布局创建描述符集
    pub fn create_descriptor_set(&self, layout: PipelineLayoutHandle, set_index: u32) -> Result<DescriptorSetHandle> {
        let _guard = self.creation_guard();
        let mut resources = lock(&self.resources);
        let layout_entry = resources.pipeline_layouts.get(layout).ok_or_else(|| invalid("pipeline layout"))?;
        let set_desc = layout_entry.desc.sets.get(set_index as usize).cloned().ok_or_else(|| {
            GraphicsError::ResourceCreation(format!("pipeline layout {:?} has no set {}", layout, set_index))
        })?;

        let native = self
            .backend
            .create_descriptor_set(&layout_entry.native, set_index, &set_desc)?;
        Ok(resources.descriptor_sets.add(DescriptorSetEntry {
            native,
            state: DescriptorSetState::new(set_index, set_desc),
        }))
    }

    pub fn destroy_descriptor_set(&self, handle: DescriptorSetHandle) {
        let _guard = self.creation_guard();
        match lock(&self.resources).descriptor_sets.remove(handle) {
            Some(entry) => self.backend.destroy_descriptor_set(entry.native),
            None => error!(?handle, "Destroying an invalid descriptor set handle"),
        }
    }

    /// 更新缓冲区描述符
    ///
    /// 绑定点、数量、类型任一校验失败时记录错误并跳过，不发起原生调用。
    /// 同一个描述符集不能在多个线程上同时更新。
    pub fn update_descriptor_buffers(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        first_element: u32,
        updates: &[BufferBinding],
    ) -> Result<()> {
        let resources = lock(&self.resources);
        let result = (|| -> std::result::Result<(), DescriptorUpdateError> {
            let entry = resources.descriptor_sets.get(set).ok_or(DescriptorUpdateError::InvalidSet)?;
            let declared = entry.state.validate_update(
                binding,
                first_element,
                updates.len() as u32,
                DescriptorUpdateKind::Buffer,
            )?;

            let writes = updates
                .iter()
                .map(|update| {
                    let buffer = match resources.buffers.get(update.buffer) {
                        Some(buffer) if update.offset < buffer.desc.size => buffer,
                        _ => return Err(DescriptorUpdateError::InvalidResource { binding }),
                    };
                    let available = buffer.desc.size - update.offset;
                    let range = update.range.unwrap_or(available);
                    if range == 0 || range > available {
                        return Err(DescriptorUpdateError::InvalidResource { binding });
                    }
                    Ok(BufferWrite { buffer: &buffer.native, offset: update.offset, range })
                })
                .collect::<std::result::Result<Vec<BufferWrite<'_, B>>, DescriptorUpdateError>>()?;

            self.backend.write_descriptor_buffers(&entry.native, declared, first_element, &writes);
            Ok(())
        })();

        result.map_err(|e| {
            error!(?set, binding, "Descriptor buffer update rejected: {}", e);
            e.into()
        })
    }

    /// 更新图像 / 采样器描述符
    pub fn update_descriptor_images(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        first_element: u32,
        updates: &[ImageBinding],
    ) -> Result<()> {
        let resources = lock(&self.resources);
        let result = (|| -> std::result::Result<(), DescriptorUpdateError> {
            let entry = resources.descriptor_sets.get(set).ok_or(DescriptorUpdateError::InvalidSet)?;
            let declared = entry.state.validate_update(
                binding,
                first_element,
                updates.len() as u32,
                DescriptorUpdateKind::Image,
            )?;

            let needs_texture = !matches!(declared.ty, DescriptorType::Sampler);
            let needs_sampler = matches!(declared.ty, DescriptorType::Sampler | DescriptorType::CombinedImageSampler);

            let writes = updates
                .iter()
                .map(|update| {
                    let texture = match update.texture {
                        Some(handle) => match resources.textures.get(handle) {
                            Some(TextureEntry::Native { native, .. }) => Some(native),
                            _ => return Err(DescriptorUpdateError::InvalidResource { binding }),
                        },
                        None => None,
                    };
                    let sampler = match update.sampler {
                        Some(handle) => match resources.samplers.get(handle) {
                            Some(sampler) => Some(sampler),
                            None => return Err(DescriptorUpdateError::InvalidResource { binding }),
                        },
                        None => None,
                    };
                    if (needs_texture && texture.is_none()) || (needs_sampler && sampler.is_none()) {
                        return Err(DescriptorUpdateError::InvalidResource { binding });
                    }
                    Ok(ImageWrite { texture, sampler })
                })
                .collect::<std::result::Result<Vec<ImageWrite<'_, B>>, DescriptorUpdateError>>()?;

            self.backend.write_descriptor_images(&entry.native, declared, first_element, &writes);
            Ok(())
        })();

        result.map_err(|e| {
            error!(?set, binding, "Descriptor image update rejected: {}", e);
            e.into()
        })
    }
}

fn check_host_range(desc: &BufferDesc, offset: u64, len: usize) -> Result<()> {
    if !desc.memory.is_host_visible() {
        return Err(GraphicsError::InvalidHandle(format!(
            "buffer {:?} is not host visible",
            desc.name.as_deref().unwrap_or("<unnamed>")
        ))
        .into());
    }
    if offset.saturating_add(len as u64) > desc.size {
        return Err(GraphicsError::CommandExecution(format!(
            "host access [{}, {}) exceeds buffer size {}",
            offset,
            offset + len as u64,
            desc.size
        ))
        .into());
    }
    Ok(())
}
