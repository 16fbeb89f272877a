//! Metal 命令录制
//!
//! 命令列表不直接持有 `MTLCommandBuffer`：录制阶段把句柄解析成原生对象并存为
//! [`Op`]，提交时再统一编码。这样一级列表可以按提交顺序合并进同一个命令缓冲区，
//! 二级列表则是一段可以复制进任意一级列表的操作序列。
//!
//! Metal 自动跟踪默认资源的读写冲突，屏障不生成任何操作。

use ::metal::MTLSize;
use tracing::{debug, error, warn};

use super::execute::{BufferImageCopy, ColorTarget, DepthTarget, Op, RenderBind};
use super::pipeline::{MetalPipeline, VERTEX_BUFFER_BASE};
use super::{convert, MetalBackend, MetalBuffer};
use crate::backend::{Backend, CommandListLevel, EncodeContext, TextureRef};
use crate::command::*;
use crate::core::error::Result;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle, TextureHandle,
};
use crate::resource::{BufferDesc, Format};
use crate::shader::ShaderStages;

/// 间接绘制参数的自然步长
const DRAW_INDIRECT_STRIDE: u64 = 16;
const DRAW_INDEXED_INDIRECT_STRIDE: u64 = 20;

/// 缓冲区中一行与一层的字节数；`row_length` / `image_height` 为 0 表示紧密排列
fn buffer_layout(region: &BufferTextureCopyRegion, format: Format) -> (u64, u64) {
    let texels = if region.row_length == 0 { region.extent[0] } else { region.row_length };
    let rows = if region.image_height == 0 { region.extent[1] } else { region.image_height };
    let bytes_per_row = u64::from(texels) * u64::from(format.bytes_per_pixel());
    (bytes_per_row, bytes_per_row * u64::from(rows))
}

pub struct MetalEncoder<'a> {
    backend: &'a MetalBackend,
    ops: &'a mut Vec<Op>,
    ctx: EncodeContext<'a, MetalBackend>,
    intermediates: Vec<MetalBuffer>,
    in_render_pass: bool,
}

impl<'a> MetalEncoder<'a> {
    pub(super) fn new(backend: &'a MetalBackend, ops: &'a mut Vec<Op>, ctx: EncodeContext<'a, MetalBackend>) -> Self {
        ops.clear();
        Self { backend, ops, ctx, intermediates: Vec::new(), in_render_pass: false }
    }

    pub(super) fn finish(mut self) -> Result<Vec<MetalBuffer>> {
        if self.in_render_pass {
            warn!("Command list closed inside a render pass");
            self.ops.push(Op::EndRenderPass);
        }
        Ok(self.intermediates)
    }

    fn is_secondary(&self) -> bool {
        self.ctx.level() == CommandListLevel::Secondary
    }

    /// 二级列表不能录制的命令记录错误并返回 `true`
    fn rejected_in_secondary(&self, command: CommandKind) -> bool {
        if self.is_secondary() {
            error!(command = command.name(), "Command is not allowed in a secondary command list, command skipped");
            return true;
        }
        false
    }

    /// 拷贝类命令不能出现在渲染通道内
    fn rejected_for_copy(&self, command: CommandKind) -> bool {
        if self.rejected_in_secondary(command) {
            return true;
        }
        if self.in_render_pass {
            error!(command = command.name(), "Copy commands are not allowed inside a render pass, command skipped");
            return true;
        }
        false
    }

    fn buffer(&self, handle: BufferHandle, command: CommandKind) -> Option<&'a MetalBuffer> {
        let buffer = self.ctx.buffer(handle);
        if buffer.is_none() {
            error!(?handle, command = command.name(), "Invalid buffer handle, command skipped");
        }
        buffer
    }

    fn texture(&self, handle: TextureHandle, command: CommandKind) -> Option<(::metal::Texture, Format)> {
        let resolved = match self.ctx.texture(handle) {
            Some(TextureRef::Native(texture)) => Some((texture.raw.clone(), texture.format)),
            Some(TextureRef::Swapchain { swapchain, image }) => swapchain
                .drawables
                .get(image as usize)
                .and_then(Option::as_ref)
                .map(|drawable| (drawable.texture().to_owned(), swapchain.format)),
            None => None,
        };
        if resolved.is_none() {
            error!(?handle, command = command.name(), "Invalid texture handle, command skipped");
        }
        resolved
    }

    fn staging(&mut self, data: &[u8], command: CommandKind) -> Option<::metal::Buffer> {
        let staging = match self.backend.create_buffer(&BufferDesc::staging(data.len() as u64)) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(command = command.name(), "Failed to create staging buffer: {}", e);
                return None;
            }
        };
        if let Err(e) = self.backend.write_buffer(&staging, 0, data) {
            error!(command = command.name(), "Failed to fill staging buffer: {}", e);
            self.backend.destroy_buffer(staging);
            return None;
        }
        let raw = staging.raw.clone();
        self.intermediates.push(staging);
        Some(raw)
    }

    fn draw_allowed(&self, command: CommandKind) -> bool {
        // 二级列表在一级列表的渲染通道内执行
        if !self.in_render_pass && !self.is_secondary() {
            error!(command = command.name(), "Draw outside a render pass, command skipped");
            return false;
        }
        true
    }

    fn dispatch_allowed(&self, command: CommandKind) -> bool {
        if self.in_render_pass {
            error!(command = command.name(), "Dispatch inside a render pass, command skipped");
            return false;
        }
        true
    }

    fn buffer_texture_copies(
        &self,
        format: Format,
        regions: &[BufferTextureCopyRegion],
    ) -> Vec<BufferImageCopy> {
        regions
            .iter()
            .map(|region| {
                let (bytes_per_row, bytes_per_image) = buffer_layout(region, format);
                BufferImageCopy { region: *region, bytes_per_row, bytes_per_image }
            })
            .collect()
    }
}

impl CommandEncoder for MetalEncoder<'_> {
    fn begin_render_pass(&mut self, colors: &[ColorAttachment], depth: Option<&DepthAttachment>, area: Scissor) {
        if self.rejected_in_secondary(CommandKind::BeginRenderPass) {
            return;
        }
        if self.in_render_pass {
            error!("Render pass begun inside another render pass, command skipped");
            return;
        }

        let mut targets = Vec::with_capacity(colors.len());
        for color in colors {
            let Some((texture, _)) = self.texture(color.texture, CommandKind::BeginRenderPass) else {
                return;
            };
            targets.push(ColorTarget {
                texture,
                load: convert::load_action(color.load_op()),
                store: convert::store_action(color.store_op()),
                clear: color.clear_color,
            });
        }
        let depth = match depth {
            Some(depth) => {
                let Some((texture, format)) = self.texture(depth.texture, CommandKind::BeginRenderPass) else {
                    return;
                };
                Some(DepthTarget {
                    texture,
                    load: convert::load_action(depth.load_op),
                    store: convert::store_action(depth.store_op),
                    clear_depth: depth.clear_depth,
                    clear_stencil: depth.clear_stencil,
                    stencil: format.has_stencil(),
                })
            }
            None => None,
        };

        self.ops.push(Op::BeginRenderPass { colors: targets, depth, area });
        self.in_render_pass = true;
    }

    fn end_render_pass(&mut self) {
        if self.rejected_in_secondary(CommandKind::EndRenderPass) {
            return;
        }
        if !self.in_render_pass {
            error!("end_render_pass without an active render pass");
            return;
        }
        self.ops.push(Op::EndRenderPass);
        self.in_render_pass = false;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.ops.push(Op::SetViewport(*viewport));
    }

    fn set_scissor(&mut self, scissor: &Scissor) {
        self.ops.push(Op::SetScissor(*scissor));
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        let Some((native, _)) = self.ctx.pipeline(pipeline) else {
            error!(?pipeline, "Invalid pipeline handle, command skipped");
            return;
        };
        let op = match native {
            MetalPipeline::Render(state) => Op::BindRenderPipeline(RenderBind {
                pipeline: state.pipeline.clone(),
                depth_stencil: state.depth_stencil.clone(),
                cull: state.cull,
                winding: state.winding,
                primitive: state.primitive,
            }),
            MetalPipeline::Compute { pipeline, threads } => {
                Op::BindComputePipeline { pipeline: pipeline.clone(), threads: *threads }
            }
        };
        self.ops.push(op);
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, bindings: &[VertexBufferBinding]) {
        for (i, binding) in bindings.iter().enumerate() {
            let Some(buffer) = self.buffer(binding.buffer, CommandKind::BindVertexBuffers) else {
                return;
            };
            self.ops.push(Op::SetVertexBuffer {
                index: VERTEX_BUFFER_BASE + u64::from(first_binding) + i as u64,
                buffer: buffer.raw.clone(),
                offset: binding.offset,
            });
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        if let Some(buffer) = self.buffer(buffer, CommandKind::BindIndexBuffer) {
            self.ops.push(Op::SetIndexBuffer {
                buffer: buffer.raw.clone(),
                offset,
                ty: convert::index_type(index_type),
                size: index_type.size(),
            });
        }
    }

    fn draw(&mut self, args: &DrawArgs) {
        if self.draw_allowed(CommandKind::Draw) {
            self.ops.push(Op::Draw(*args));
        }
    }

    fn draw_indexed(&mut self, args: &DrawIndexedArgs) {
        if self.draw_allowed(CommandKind::DrawIndexed) {
            self.ops.push(Op::DrawIndexed(*args));
        }
    }

    fn draw_indirect(&mut self, args: &IndirectArgs) {
        if !self.draw_allowed(CommandKind::DrawIndirect) {
            return;
        }
        if let Some(buffer) = self.buffer(args.buffer, CommandKind::DrawIndirect) {
            let stride = if args.stride == 0 { DRAW_INDIRECT_STRIDE } else { u64::from(args.stride) };
            self.ops.push(Op::DrawIndirect {
                buffer: buffer.raw.clone(),
                offset: args.offset,
                count: args.draw_count,
                stride,
                indexed: false,
            });
        }
    }

    fn draw_indexed_indirect(&mut self, args: &IndirectArgs) {
        if !self.draw_allowed(CommandKind::DrawIndexedIndirect) {
            return;
        }
        if let Some(buffer) = self.buffer(args.buffer, CommandKind::DrawIndexedIndirect) {
            let stride = if args.stride == 0 { DRAW_INDEXED_INDIRECT_STRIDE } else { u64::from(args.stride) };
            self.ops.push(Op::DrawIndirect {
                buffer: buffer.raw.clone(),
                offset: args.offset,
                count: args.draw_count,
                stride,
                indexed: true,
            });
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if self.dispatch_allowed(CommandKind::Dispatch) {
            self.ops.push(Op::Dispatch(MTLSize::new(u64::from(x), u64::from(y), u64::from(z))));
        }
    }

    fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        if !self.dispatch_allowed(CommandKind::DispatchIndirect) {
            return;
        }
        if let Some(buffer) = self.buffer(buffer, CommandKind::DispatchIndirect) {
            self.ops.push(Op::DispatchIndirect { buffer: buffer.raw.clone(), offset });
        }
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]) {
        if self.rejected_for_copy(CommandKind::CopyBuffer) {
            return;
        }
        let (Some(src), Some(dst)) = (self.buffer(src, CommandKind::CopyBuffer), self.buffer(dst, CommandKind::CopyBuffer))
        else {
            return;
        };
        self.ops.push(Op::CopyBuffer { src: src.raw.clone(), dst: dst.raw.clone(), regions: regions.to_vec() });
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, regions: &[TextureCopyRegion]) {
        if self.rejected_for_copy(CommandKind::CopyTexture) {
            return;
        }
        let (Some((src, _)), Some((dst, _))) =
            (self.texture(src, CommandKind::CopyTexture), self.texture(dst, CommandKind::CopyTexture))
        else {
            return;
        };
        self.ops.push(Op::CopyTexture { src, dst, regions: regions.to_vec() });
    }

    fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, regions: &[BufferTextureCopyRegion]) {
        if self.rejected_for_copy(CommandKind::CopyBufferToTexture) {
            return;
        }
        let (Some(src), Some((dst, format))) = (
            self.buffer(src, CommandKind::CopyBufferToTexture),
            self.texture(dst, CommandKind::CopyBufferToTexture),
        ) else {
            return;
        };
        let copies = self.buffer_texture_copies(format, regions);
        self.ops.push(Op::CopyBufferToTexture { src: src.raw.clone(), dst, copies });
    }

    fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, regions: &[BufferTextureCopyRegion]) {
        if self.rejected_for_copy(CommandKind::CopyTextureToBuffer) {
            return;
        }
        let (Some((src, format)), Some(dst)) = (
            self.texture(src, CommandKind::CopyTextureToBuffer),
            self.buffer(dst, CommandKind::CopyTextureToBuffer),
        ) else {
            return;
        };
        let copies = self.buffer_texture_copies(format, regions);
        self.ops.push(Op::CopyTextureToBuffer { src, dst: dst.raw.clone(), copies });
    }

    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        if data.is_empty() || self.rejected_for_copy(CommandKind::UpdateBuffer) {
            return;
        }
        let Some(dst) = self.buffer(dst, CommandKind::UpdateBuffer) else {
            return;
        };
        let Some(staging) = self.staging(data, CommandKind::UpdateBuffer) else {
            return;
        };
        self.ops.push(Op::CopyBuffer {
            src: staging,
            dst: dst.raw.clone(),
            regions: vec![BufferCopyRegion { src_offset: 0, dst_offset: offset, size: data.len() as u64 }],
        });
    }

    fn upload_texture(&mut self, dst: TextureHandle, region: &BufferTextureCopyRegion, data: &[u8]) {
        if data.is_empty() || self.rejected_for_copy(CommandKind::UploadTexture) {
            return;
        }
        let Some((texture, format)) = self.texture(dst, CommandKind::UploadTexture) else {
            return;
        };
        let (bytes_per_row, bytes_per_image) = buffer_layout(region, format);
        let required = bytes_per_image * u64::from(region.extent[2].max(1));
        if (data.len() as u64) < required {
            error!(required, provided = data.len(), "Texture upload data is too short, command skipped");
            return;
        }
        let Some(staging) = self.staging(data, CommandKind::UploadTexture) else {
            return;
        };
        let mut region = *region;
        region.buffer_offset = 0;
        self.ops.push(Op::CopyBufferToTexture {
            src: staging,
            dst: texture,
            copies: vec![BufferImageCopy { region, bytes_per_row, bytes_per_image }],
        });
    }

    fn bind_descriptor_set(
        &mut self,
        _bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        let (Some(native_layout), Some(native_set)) = (self.ctx.pipeline_layout(layout), self.ctx.descriptor_set(set))
        else {
            error!(?layout, ?set, "Invalid descriptor set binding, command skipped");
            return;
        };
        if native_layout.sets.get(set_index as usize).is_none() {
            error!(?layout, set_index, "Pipeline layout has no such descriptor set, command skipped");
            return;
        }
        self.ops.push(Op::BindArguments(native_set.snapshot()));
    }

    fn push_constants(&mut self, layout: PipelineLayoutHandle, stages: ShaderStages, offset: u32, data: &[u8]) {
        let Some(native) = self.ctx.pipeline_layout(layout) else {
            error!(?layout, "Invalid pipeline layout handle, command skipped");
            return;
        };
        if native.push_constant_size == 0 {
            error!(?layout, "Pipeline layout declares no push constants, command skipped");
            return;
        }
        if offset as usize + data.len() > native.push_constant_size as usize {
            error!(
                offset,
                len = data.len(),
                declared = native.push_constant_size,
                "Push constant range exceeds the layout, command skipped"
            );
            return;
        }
        self.ops.push(Op::PushConstants { stages, offset, data: data.to_vec() });
    }

    fn resource_barrier(&mut self, _textures: &[TextureBarrier], _buffers: &[BufferBarrier]) {
        self.rejected_in_secondary(CommandKind::ResourceBarrier);
    }

    fn execute_secondary(&mut self, stream: CommandStreamHandle) {
        if self.is_secondary() {
            error!(?stream, "Secondary command lists cannot execute other secondaries");
            return;
        }
        match self.ctx.secondary(stream) {
            Some(list) => self.ops.extend(list.ops.iter().cloned()),
            None => debug!(?stream, "Secondary command stream has nothing to execute this frame, command skipped"),
        }
    }

    fn begin_debug_label(&mut self, name: &str, _color: [f32; 4]) {
        self.ops.push(Op::PushDebugGroup(name.to_string()));
    }

    fn end_debug_label(&mut self) {
        self.ops.push(Op::PopDebugGroup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tight_buffer_layout() {
        let region = BufferTextureCopyRegion::full_2d(64, 32);
        assert_eq!(buffer_layout(&region, Format::Rgba8Unorm), (256, 256 * 32));
    }

    #[test]
    fn test_buffer_layout_uses_row_length_and_image_height() {
        let mut region = BufferTextureCopyRegion::full_2d(10, 10);
        region.row_length = 16;
        region.image_height = 12;
        assert_eq!(buffer_layout(&region, Format::R32Float), (64, 64 * 12));
    }
}
