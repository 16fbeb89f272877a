//! 命令分发
//!
//! 每个后端为自己的原生录制上下文实现 `CommandEncoder`，每种命令对应一个方法。
//! `replay` 按录制顺序遍历命令流，对 `Command` 做穷尽匹配后调用对应方法；
//! 新增命令种类时，所有后端都必须补上处理函数，否则无法通过编译。

use crate::command::stream::{Command, CommandStream, PushConstantData};
use crate::command::types::*;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle,
    TextureHandle,
};
use crate::shader::ShaderStages;

/// 原生命令录制接口
pub trait CommandEncoder {
    fn begin_render_pass(&mut self, colors: &[ColorAttachment], depth: Option<&DepthAttachment>, area: Scissor);
    fn end_render_pass(&mut self);
    fn set_viewport(&mut self, viewport: &Viewport);
    fn set_scissor(&mut self, scissor: &Scissor);
    fn bind_pipeline(&mut self, pipeline: PipelineHandle);
    fn bind_vertex_buffers(&mut self, first_binding: u32, bindings: &[VertexBufferBinding]);
    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType);
    fn draw(&mut self, args: &DrawArgs);
    fn draw_indexed(&mut self, args: &DrawIndexedArgs);
    fn draw_indirect(&mut self, args: &IndirectArgs);
    fn draw_indexed_indirect(&mut self, args: &IndirectArgs);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: u64);
    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]);
    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, regions: &[TextureCopyRegion]);
    fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, regions: &[BufferTextureCopyRegion]);
    fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, regions: &[BufferTextureCopyRegion]);
    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]);
    fn upload_texture(&mut self, dst: TextureHandle, region: &BufferTextureCopyRegion, data: &[u8]);
    fn bind_descriptor_set(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    );
    fn push_constants(&mut self, layout: PipelineLayoutHandle, stages: ShaderStages, offset: u32, data: &[u8]);
    fn resource_barrier(&mut self, textures: &[TextureBarrier], buffers: &[BufferBarrier]);
    fn execute_secondary(&mut self, stream: CommandStreamHandle);
    fn begin_debug_label(&mut self, name: &str, color: [f32; 4]);
    fn end_debug_label(&mut self);
}

/// 按录制顺序把命令流翻译到 `encoder`
pub fn replay<E: CommandEncoder + ?Sized>(stream: &CommandStream, encoder: &mut E) {
    let aux = stream.aux();

    for command in stream.commands() {
        match command {
            Command::BeginRenderPass { colors, depth, render_area } => {
                encoder.begin_render_pass(aux.get(*colors), depth.as_ref(), *render_area)
            }
            Command::EndRenderPass => encoder.end_render_pass(),
            Command::SetViewport(viewport) => encoder.set_viewport(viewport),
            Command::SetScissor(scissor) => encoder.set_scissor(scissor),
            Command::BindPipeline(pipeline) => encoder.bind_pipeline(*pipeline),
            Command::BindVertexBuffers { first_binding, bindings } => {
                encoder.bind_vertex_buffers(*first_binding, aux.get(*bindings))
            }
            Command::BindIndexBuffer { buffer, offset, index_type } => {
                encoder.bind_index_buffer(*buffer, *offset, *index_type)
            }
            Command::Draw(args) => encoder.draw(args),
            Command::DrawIndexed(args) => encoder.draw_indexed(args),
            Command::DrawIndirect(args) => encoder.draw_indirect(args),
            Command::DrawIndexedIndirect(args) => encoder.draw_indexed_indirect(args),
            Command::Dispatch { x, y, z } => encoder.dispatch(*x, *y, *z),
            Command::DispatchIndirect { buffer, offset } => encoder.dispatch_indirect(*buffer, *offset),
            Command::CopyBuffer { src, dst, regions } => encoder.copy_buffer(*src, *dst, aux.get(*regions)),
            Command::CopyTexture { src, dst, regions } => encoder.copy_texture(*src, *dst, aux.get(*regions)),
            Command::CopyBufferToTexture { src, dst, regions } => {
                encoder.copy_buffer_to_texture(*src, *dst, aux.get(*regions))
            }
            Command::CopyTextureToBuffer { src, dst, regions } => {
                encoder.copy_texture_to_buffer(*src, *dst, aux.get(*regions))
            }
            Command::UpdateBuffer { dst, offset, data } => encoder.update_buffer(*dst, *offset, aux.get(*data)),
            Command::UploadTexture { dst, region, data } => encoder.upload_texture(*dst, region, aux.get(*data)),
            Command::BindDescriptorSet { bind_point, layout, set_index, set } => {
                encoder.bind_descriptor_set(*bind_point, *layout, *set_index, *set)
            }
            Command::PushConstants { layout, stages, offset, data } => {
                let bytes = match data {
                    PushConstantData::Inline(slice) => aux.get(*slice),
                    PushConstantData::ConstantBlock { offset, size } => {
                        let start = *offset as usize;
                        let end = start + *size as usize;
                        match stream.constant_block().and_then(|block| block.get(start..end)) {
                            Some(bytes) => bytes,
                            None => {
                                tracing::error!(
                                    stream = ?stream.handle(),
                                    start,
                                    end,
                                    "Push constant range lies outside the constant block, skipping"
                                );
                                continue;
                            }
                        }
                    }
                };
                encoder.push_constants(*layout, *stages, *offset, bytes)
            }
            Command::ResourceBarrier { textures, buffers } => {
                encoder.resource_barrier(aux.get(*textures), aux.get(*buffers))
            }
            Command::ExecuteSecondary(secondary) => encoder.execute_secondary(*secondary),
            Command::BeginDebugLabel { name, color } => {
                let name = std::str::from_utf8(aux.get(*name)).unwrap_or("<invalid utf-8>");
                encoder.begin_debug_label(name, *color)
            }
            Command::EndDebugLabel => encoder.end_debug_label(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::stream::{CommandKind, CommandStreamDesc};
    use crate::queue::QueueType;

    /// 只记录调用顺序的编码器
    #[derive(Default)]
    pub(crate) struct RecordingEncoder {
        pub calls: Vec<CommandKind>,
        pub payloads: Vec<Vec<u8>>,
    }

    impl CommandEncoder for RecordingEncoder {
        fn begin_render_pass(&mut self, _: &[ColorAttachment], _: Option<&DepthAttachment>, _: Scissor) {
            self.calls.push(CommandKind::BeginRenderPass);
        }
        fn end_render_pass(&mut self) {
            self.calls.push(CommandKind::EndRenderPass);
        }
        fn set_viewport(&mut self, _: &Viewport) {
            self.calls.push(CommandKind::SetViewport);
        }
        fn set_scissor(&mut self, _: &Scissor) {
            self.calls.push(CommandKind::SetScissor);
        }
        fn bind_pipeline(&mut self, _: PipelineHandle) {
            self.calls.push(CommandKind::BindPipeline);
        }
        fn bind_vertex_buffers(&mut self, _: u32, _: &[VertexBufferBinding]) {
            self.calls.push(CommandKind::BindVertexBuffers);
        }
        fn bind_index_buffer(&mut self, _: BufferHandle, _: u64, _: IndexType) {
            self.calls.push(CommandKind::BindIndexBuffer);
        }
        fn draw(&mut self, _: &DrawArgs) {
            self.calls.push(CommandKind::Draw);
        }
        fn draw_indexed(&mut self, _: &DrawIndexedArgs) {
            self.calls.push(CommandKind::DrawIndexed);
        }
        fn draw_indirect(&mut self, _: &IndirectArgs) {
            self.calls.push(CommandKind::DrawIndirect);
        }
        fn draw_indexed_indirect(&mut self, _: &IndirectArgs) {
            self.calls.push(CommandKind::DrawIndexedIndirect);
        }
        fn dispatch(&mut self, _: u32, _: u32, _: u32) {
            self.calls.push(CommandKind::Dispatch);
        }
        fn dispatch_indirect(&mut self, _: BufferHandle, _: u64) {
            self.calls.push(CommandKind::DispatchIndirect);
        }
        fn copy_buffer(&mut self, _: BufferHandle, _: BufferHandle, _: &[BufferCopyRegion]) {
            self.calls.push(CommandKind::CopyBuffer);
        }
        fn copy_texture(&mut self, _: TextureHandle, _: TextureHandle, _: &[TextureCopyRegion]) {
            self.calls.push(CommandKind::CopyTexture);
        }
        fn copy_buffer_to_texture(&mut self, _: BufferHandle, _: TextureHandle, _: &[BufferTextureCopyRegion]) {
            self.calls.push(CommandKind::CopyBufferToTexture);
        }
        fn copy_texture_to_buffer(&mut self, _: TextureHandle, _: BufferHandle, _: &[BufferTextureCopyRegion]) {
            self.calls.push(CommandKind::CopyTextureToBuffer);
        }
        fn update_buffer(&mut self, _: BufferHandle, _: u64, data: &[u8]) {
            self.calls.push(CommandKind::UpdateBuffer);
            self.payloads.push(data.to_vec());
        }
        fn upload_texture(&mut self, _: TextureHandle, _: &BufferTextureCopyRegion, data: &[u8]) {
            self.calls.push(CommandKind::UploadTexture);
            self.payloads.push(data.to_vec());
        }
        fn bind_descriptor_set(&mut self, _: PipelineBindPoint, _: PipelineLayoutHandle, _: u32, _: DescriptorSetHandle) {
            self.calls.push(CommandKind::BindDescriptorSet);
        }
        fn push_constants(&mut self, _: PipelineLayoutHandle, _: ShaderStages, _: u32, data: &[u8]) {
            self.calls.push(CommandKind::PushConstants);
            self.payloads.push(data.to_vec());
        }
        fn resource_barrier(&mut self, _: &[TextureBarrier], _: &[BufferBarrier]) {
            self.calls.push(CommandKind::ResourceBarrier);
        }
        fn execute_secondary(&mut self, _: CommandStreamHandle) {
            self.calls.push(CommandKind::ExecuteSecondary);
        }
        fn begin_debug_label(&mut self, name: &str, _: [f32; 4]) {
            self.calls.push(CommandKind::BeginDebugLabel);
            self.payloads.push(name.as_bytes().to_vec());
        }
        fn end_debug_label(&mut self) {
            self.calls.push(CommandKind::EndDebugLabel);
        }
    }

    fn new_stream() -> CommandStream {
        CommandStream::new(
            CommandStreamHandle::from_raw(0),
            &CommandStreamDesc {
                queue_type: QueueType::Graphics,
                command_capacity: 16,
                aux_memory_bytes: 512,
                constant_block_bytes: 32,
            },
        )
    }

    #[test]
    fn test_replay_in_recorded_order() {
        let mut stream = new_stream();
        let buffer = BufferHandle::from_raw(1);
        stream.begin_debug_label("frame", [1.0; 4]);
        stream.resource_barrier(&[], &[BufferBarrier::new(buffer, ResourceState::Common, ResourceState::CopyDst)]);
        stream.update_buffer(buffer, 0, &[1, 2, 3]);
        stream.dispatch(8, 8, 1);
        stream.set_scissor(Scissor::new(4, 4));
        stream.end_debug_label();

        let mut encoder = RecordingEncoder::default();
        replay(&stream, &mut encoder);

        assert_eq!(
            encoder.calls,
            vec![
                CommandKind::BeginDebugLabel,
                CommandKind::ResourceBarrier,
                CommandKind::UpdateBuffer,
                CommandKind::Dispatch,
                CommandKind::SetScissor,
                CommandKind::EndDebugLabel,
            ]
        );
        assert_eq!(encoder.payloads, vec![b"frame".to_vec(), vec![1, 2, 3]]);
    }

    #[test]
    fn test_reset_leaves_no_residue() {
        let mut stream = new_stream();
        stream.dispatch(1, 1, 1);
        stream.draw(3, 1, 0, 0);
        stream.update_buffer(BufferHandle::from_raw(0), 0, &[9, 9]);
        stream.reset();
        stream.set_viewport(Viewport::new(1.0, 1.0));
        stream.update_buffer(BufferHandle::from_raw(0), 0, &[7]);

        let mut fresh = new_stream();
        fresh.set_viewport(Viewport::new(1.0, 1.0));
        fresh.update_buffer(BufferHandle::from_raw(0), 0, &[7]);

        let mut reused = RecordingEncoder::default();
        replay(&stream, &mut reused);
        let mut expected = RecordingEncoder::default();
        replay(&fresh, &mut expected);

        assert_eq!(reused.calls, expected.calls);
        assert_eq!(reused.payloads, expected.payloads);
        assert_eq!(reused.calls, vec![CommandKind::SetViewport, CommandKind::UpdateBuffer]);
    }

    #[test]
    fn test_push_constants_from_constant_block() {
        let mut stream = new_stream();
        let layout = PipelineLayoutHandle::from_raw(0);
        let offset = stream.write_to_constant_block(&[4, 3, 2, 1]);
        stream.push_constants_from_block(layout, ShaderStages::COMPUTE, 0, offset, 4);
        stream.push_constants(layout, ShaderStages::COMPUTE, 4, &[5, 6, 7, 8]);

        let mut encoder = RecordingEncoder::default();
        replay(&stream, &mut encoder);
        assert_eq!(encoder.payloads, vec![vec![4, 3, 2, 1], vec![5, 6, 7, 8]]);
    }

    #[test]
    fn test_out_of_range_constant_block_is_skipped() {
        let mut stream = new_stream();
        stream.push_constants_from_block(PipelineLayoutHandle::from_raw(0), ShaderStages::VERTEX, 0, 0, 16);
        stream.draw(3, 1, 0, 0);

        let mut encoder = RecordingEncoder::default();
        replay(&stream, &mut encoder);
        assert_eq!(encoder.calls, vec![CommandKind::Draw]);
    }
}
