use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{NullBackend, NullBuffer, NullCommandList, NullOp};
use crate::backend::{CommandListLevel, EncodeContext, TextureRef};
use crate::command::*;
use crate::core::sync::lock;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle,
    TextureHandle,
};
use crate::shader::ShaderStages;

/// 模拟编码器
///
/// 记录命令种类并校验句柄；缓冲区写入与拷贝转换为提交时执行的内存操作。
pub struct NullEncoder<'a> {
    backend: &'a NullBackend,
    list: &'a mut NullCommandList,
    ctx: EncodeContext<'a, NullBackend>,
    intermediates: Vec<NullBuffer>,
    render_pass_depth: u32,
}

impl<'a> NullEncoder<'a> {
    pub(super) fn new(backend: &'a NullBackend, list: &'a mut NullCommandList, ctx: EncodeContext<'a, NullBackend>) -> Self {
        Self {
            backend,
            list,
            ctx,
            intermediates: Vec::new(),
            render_pass_depth: 0,
        }
    }

    pub(super) fn finish(self) -> Vec<NullBuffer> {
        if self.render_pass_depth > 0 {
            warn!(list = self.list.id, "Command list closed inside a render pass");
        }
        self.intermediates
    }

    fn push(&mut self, kind: CommandKind) {
        self.list.kinds.push(kind);
    }

    fn buffer(&self, handle: BufferHandle, command: CommandKind) -> Option<&'a NullBuffer> {
        let buffer = self.ctx.buffer(handle);
        if buffer.is_none() {
            error!(?handle, command = command.name(), "Invalid buffer handle, command skipped");
        }
        buffer
    }

    fn check_texture(&self, handle: TextureHandle, command: CommandKind) -> bool {
        match self.ctx.texture(handle) {
            Some(TextureRef::Native(_)) | Some(TextureRef::Swapchain { .. }) => true,
            None => {
                error!(?handle, command = command.name(), "Invalid texture handle, command skipped");
                false
            }
        }
    }

    fn staging(&mut self, data: &[u8]) -> Arc<std::sync::Mutex<Vec<u8>>> {
        let staging = self.backend.make_buffer(data.len() as u64);
        lock(&staging.data).copy_from_slice(data);
        let shared = staging.data.clone();
        self.intermediates.push(staging);
        shared
    }
}

impl CommandEncoder for NullEncoder<'_> {
    fn begin_render_pass(&mut self, colors: &[ColorAttachment], depth: Option<&DepthAttachment>, _area: Scissor) {
        self.push(CommandKind::BeginRenderPass);
        for color in colors {
            self.check_texture(color.texture, CommandKind::BeginRenderPass);
        }
        if let Some(depth) = depth {
            self.check_texture(depth.texture, CommandKind::BeginRenderPass);
        }
        self.render_pass_depth += 1;
    }

    fn end_render_pass(&mut self) {
        self.push(CommandKind::EndRenderPass);
        self.render_pass_depth = self.render_pass_depth.saturating_sub(1);
    }

    fn set_viewport(&mut self, _viewport: &Viewport) {
        self.push(CommandKind::SetViewport);
    }

    fn set_scissor(&mut self, _scissor: &Scissor) {
        self.push(CommandKind::SetScissor);
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(CommandKind::BindPipeline);
        if self.ctx.pipeline(pipeline).is_none() {
            error!(?pipeline, "Invalid pipeline handle, command skipped");
        }
    }

    fn bind_vertex_buffers(&mut self, _first_binding: u32, bindings: &[VertexBufferBinding]) {
        self.push(CommandKind::BindVertexBuffers);
        for binding in bindings {
            self.buffer(binding.buffer, CommandKind::BindVertexBuffers);
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, _index_type: IndexType) {
        self.push(CommandKind::BindIndexBuffer);
        self.buffer(buffer, CommandKind::BindIndexBuffer);
    }

    fn draw(&mut self, _args: &DrawArgs) {
        self.push(CommandKind::Draw);
    }

    fn draw_indexed(&mut self, _args: &DrawIndexedArgs) {
        self.push(CommandKind::DrawIndexed);
    }

    fn draw_indirect(&mut self, args: &IndirectArgs) {
        self.push(CommandKind::DrawIndirect);
        self.buffer(args.buffer, CommandKind::DrawIndirect);
    }

    fn draw_indexed_indirect(&mut self, args: &IndirectArgs) {
        self.push(CommandKind::DrawIndexedIndirect);
        self.buffer(args.buffer, CommandKind::DrawIndexedIndirect);
    }

    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) {
        self.push(CommandKind::Dispatch);
    }

    fn dispatch_indirect(&mut self, buffer: BufferHandle, _offset: u64) {
        self.push(CommandKind::DispatchIndirect);
        self.buffer(buffer, CommandKind::DispatchIndirect);
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]) {
        self.push(CommandKind::CopyBuffer);
        let (Some(src), Some(dst)) = (self.buffer(src, CommandKind::CopyBuffer), self.buffer(dst, CommandKind::CopyBuffer))
        else {
            return;
        };
        self.list.ops.push(NullOp::Copy {
            src: src.data.clone(),
            dst: dst.data.clone(),
            regions: regions.to_vec(),
        });
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, _regions: &[TextureCopyRegion]) {
        self.push(CommandKind::CopyTexture);
        self.check_texture(src, CommandKind::CopyTexture);
        self.check_texture(dst, CommandKind::CopyTexture);
    }

    fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, _regions: &[BufferTextureCopyRegion]) {
        self.push(CommandKind::CopyBufferToTexture);
        self.buffer(src, CommandKind::CopyBufferToTexture);
        self.check_texture(dst, CommandKind::CopyBufferToTexture);
    }

    fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, _regions: &[BufferTextureCopyRegion]) {
        self.push(CommandKind::CopyTextureToBuffer);
        self.check_texture(src, CommandKind::CopyTextureToBuffer);
        self.buffer(dst, CommandKind::CopyTextureToBuffer);
    }

    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        self.push(CommandKind::UpdateBuffer);
        let Some(dst) = self.buffer(dst, CommandKind::UpdateBuffer) else {
            return;
        };
        let target = dst.data.clone();
        let staging = self.staging(data);
        self.list.ops.push(NullOp::Copy {
            src: staging,
            dst: target,
            regions: vec![BufferCopyRegion { src_offset: 0, dst_offset: offset, size: data.len() as u64 }],
        });
    }

    fn upload_texture(&mut self, dst: TextureHandle, _region: &BufferTextureCopyRegion, data: &[u8]) {
        self.push(CommandKind::UploadTexture);
        if self.check_texture(dst, CommandKind::UploadTexture) {
            self.staging(data);
        }
    }

    fn bind_descriptor_set(
        &mut self,
        _bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        _set_index: u32,
        set: DescriptorSetHandle,
    ) {
        self.push(CommandKind::BindDescriptorSet);
        if self.ctx.pipeline_layout(layout).is_none() || self.ctx.descriptor_set(set).is_none() {
            error!(?layout, ?set, "Invalid descriptor set binding, command skipped");
        }
    }

    fn push_constants(&mut self, layout: PipelineLayoutHandle, _stages: ShaderStages, _offset: u32, _data: &[u8]) {
        self.push(CommandKind::PushConstants);
        if self.ctx.pipeline_layout(layout).is_none() {
            error!(?layout, "Invalid pipeline layout handle, command skipped");
        }
    }

    fn resource_barrier(&mut self, textures: &[TextureBarrier], buffers: &[BufferBarrier]) {
        self.push(CommandKind::ResourceBarrier);
        for barrier in textures {
            self.check_texture(barrier.texture, CommandKind::ResourceBarrier);
        }
        for barrier in buffers {
            self.buffer(barrier.buffer, CommandKind::ResourceBarrier);
        }
    }

    fn execute_secondary(&mut self, stream: CommandStreamHandle) {
        self.push(CommandKind::ExecuteSecondary);
        if self.ctx.level() == CommandListLevel::Secondary {
            error!(?stream, "Secondary command lists cannot execute other secondaries");
            return;
        }
        match self.ctx.secondary(stream) {
            Some(secondary) => self.list.ops.extend(secondary.ops.iter().cloned()),
            None => debug!(?stream, "Secondary command stream has nothing to execute this frame, command skipped"),
        }
    }

    fn begin_debug_label(&mut self, _name: &str, _color: [f32; 4]) {
        self.push(CommandKind::BeginDebugLabel);
    }

    fn end_debug_label(&mut self) {
        self.push(CommandKind::EndDebugLabel);
    }
}
