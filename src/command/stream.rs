use crate::command::arena::{AuxArena, AuxSlice};
use crate::command::types::*;
use crate::gpu_fatal;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle,
    TextureHandle,
};
use crate::queue::QueueType;
use crate::shader::ShaderStages;

/// 推送常量的数据来源
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushConstantData {
    /// 数据直接存放在辅助内存中
    Inline(AuxSlice<u8>),
    /// 数据位于命令流常量块的某个区间
    ConstantBlock { offset: u32, size: u32 },
}

/// 一条录制好的命令
///
/// 变长负载（附件数组、拷贝区域、上传数据）存放在所属命令流的辅助内存里，
/// 这里只保存 `AuxSlice`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    BeginRenderPass {
        colors: AuxSlice<ColorAttachment>,
        depth: Option<DepthAttachment>,
        render_area: Scissor,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(Scissor),
    BindPipeline(PipelineHandle),
    BindVertexBuffers {
        first_binding: u32,
        bindings: AuxSlice<VertexBufferBinding>,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    },
    Draw(DrawArgs),
    DrawIndexed(DrawIndexedArgs),
    DrawIndirect(IndirectArgs),
    DrawIndexedIndirect(IndirectArgs),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: BufferHandle,
        offset: u64,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: AuxSlice<BufferCopyRegion>,
    },
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
        regions: AuxSlice<TextureCopyRegion>,
    },
    CopyBufferToTexture {
        src: BufferHandle,
        dst: TextureHandle,
        regions: AuxSlice<BufferTextureCopyRegion>,
    },
    CopyTextureToBuffer {
        src: TextureHandle,
        dst: BufferHandle,
        regions: AuxSlice<BufferTextureCopyRegion>,
    },
    UpdateBuffer {
        dst: BufferHandle,
        offset: u64,
        data: AuxSlice<u8>,
    },
    UploadTexture {
        dst: TextureHandle,
        region: BufferTextureCopyRegion,
        data: AuxSlice<u8>,
    },
    BindDescriptorSet {
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    },
    PushConstants {
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: PushConstantData,
    },
    ResourceBarrier {
        textures: AuxSlice<TextureBarrier>,
        buffers: AuxSlice<BufferBarrier>,
    },
    ExecuteSecondary(CommandStreamHandle),
    BeginDebugLabel {
        name: AuxSlice<u8>,
        color: [f32; 4],
    },
    EndDebugLabel,
}

/// 命令种类标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    BeginRenderPass,
    EndRenderPass,
    SetViewport,
    SetScissor,
    BindPipeline,
    BindVertexBuffers,
    BindIndexBuffer,
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    Dispatch,
    DispatchIndirect,
    CopyBuffer,
    CopyTexture,
    CopyBufferToTexture,
    CopyTextureToBuffer,
    UpdateBuffer,
    UploadTexture,
    BindDescriptorSet,
    PushConstants,
    ResourceBarrier,
    ExecuteSecondary,
    BeginDebugLabel,
    EndDebugLabel,
}

impl CommandKind {
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::BeginRenderPass => "begin_render_pass",
            CommandKind::EndRenderPass => "end_render_pass",
            CommandKind::SetViewport => "set_viewport",
            CommandKind::SetScissor => "set_scissor",
            CommandKind::BindPipeline => "bind_pipeline",
            CommandKind::BindVertexBuffers => "bind_vertex_buffers",
            CommandKind::BindIndexBuffer => "bind_index_buffer",
            CommandKind::Draw => "draw",
            CommandKind::DrawIndexed => "draw_indexed",
            CommandKind::DrawIndirect => "draw_indirect",
            CommandKind::DrawIndexedIndirect => "draw_indexed_indirect",
            CommandKind::Dispatch => "dispatch",
            CommandKind::DispatchIndirect => "dispatch_indirect",
            CommandKind::CopyBuffer => "copy_buffer",
            CommandKind::CopyTexture => "copy_texture",
            CommandKind::CopyBufferToTexture => "copy_buffer_to_texture",
            CommandKind::CopyTextureToBuffer => "copy_texture_to_buffer",
            CommandKind::UpdateBuffer => "update_buffer",
            CommandKind::UploadTexture => "upload_texture",
            CommandKind::BindDescriptorSet => "bind_descriptor_set",
            CommandKind::PushConstants => "push_constants",
            CommandKind::ResourceBarrier => "resource_barrier",
            CommandKind::ExecuteSecondary => "execute_secondary",
            CommandKind::BeginDebugLabel => "begin_debug_label",
            CommandKind::EndDebugLabel => "end_debug_label",
        }
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::BeginRenderPass { .. } => CommandKind::BeginRenderPass,
            Command::EndRenderPass => CommandKind::EndRenderPass,
            Command::SetViewport(_) => CommandKind::SetViewport,
            Command::SetScissor(_) => CommandKind::SetScissor,
            Command::BindPipeline(_) => CommandKind::BindPipeline,
            Command::BindVertexBuffers { .. } => CommandKind::BindVertexBuffers,
            Command::BindIndexBuffer { .. } => CommandKind::BindIndexBuffer,
            Command::Draw(_) => CommandKind::Draw,
            Command::DrawIndexed(_) => CommandKind::DrawIndexed,
            Command::DrawIndirect(_) => CommandKind::DrawIndirect,
            Command::DrawIndexedIndirect(_) => CommandKind::DrawIndexedIndirect,
            Command::Dispatch { .. } => CommandKind::Dispatch,
            Command::DispatchIndirect { .. } => CommandKind::DispatchIndirect,
            Command::CopyBuffer { .. } => CommandKind::CopyBuffer,
            Command::CopyTexture { .. } => CommandKind::CopyTexture,
            Command::CopyBufferToTexture { .. } => CommandKind::CopyBufferToTexture,
            Command::CopyTextureToBuffer { .. } => CommandKind::CopyTextureToBuffer,
            Command::UpdateBuffer { .. } => CommandKind::UpdateBuffer,
            Command::UploadTexture { .. } => CommandKind::UploadTexture,
            Command::BindDescriptorSet { .. } => CommandKind::BindDescriptorSet,
            Command::PushConstants { .. } => CommandKind::PushConstants,
            Command::ResourceBarrier { .. } => CommandKind::ResourceBarrier,
            Command::ExecuteSecondary(_) => CommandKind::ExecuteSecondary,
            Command::BeginDebugLabel { .. } => CommandKind::BeginDebugLabel,
            Command::EndDebugLabel => CommandKind::EndDebugLabel,
        }
    }
}

/// 命令流描述
///
/// 容量字段为 0 时使用配置中的默认值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStreamDesc {
    pub queue_type: QueueType,
    pub command_capacity: u32,
    pub aux_memory_bytes: u32,
    pub constant_block_bytes: u32,
}

impl CommandStreamDesc {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            command_capacity: 0,
            aux_memory_bytes: 0,
            constant_block_bytes: 0,
        }
    }
}

struct ConstantBlock {
    data: Vec<u8>,
    cursor: usize,
}

/// 命令流
///
/// 客户端独占的录制对象：不同的命令流可以在不同线程上并发录制，互不共享可变状态。
/// 容量在创建时固定，超出容量是致命的配置错误。
///
/// 生命周期：由设备创建 -> 每帧录制 -> `close` 翻译成原生命令 -> 提交 -> `reset`
/// -> 下一帧复用；最后交还设备销毁（同时释放对应的原生命令列表）。
pub struct CommandStream {
    handle: CommandStreamHandle,
    queue_type: QueueType,
    commands: Vec<Command>,
    capacity: usize,
    aux: AuxArena,
    constant_block: Option<ConstantBlock>,
    in_render_pass: bool,
    label_depth: u32,
}

impl CommandStream {
    pub(crate) fn new(handle: CommandStreamHandle, desc: &CommandStreamDesc) -> Self {
        let constant_block = (desc.constant_block_bytes > 0).then(|| ConstantBlock {
            data: vec![0; desc.constant_block_bytes as usize],
            cursor: 0,
        });

        Self {
            handle,
            queue_type: desc.queue_type,
            commands: Vec::with_capacity(desc.command_capacity as usize),
            capacity: desc.command_capacity as usize,
            aux: AuxArena::new(desc.aux_memory_bytes as usize),
            constant_block,
            in_render_pass: false,
            label_depth: 0,
        }
    }

    pub fn handle(&self) -> CommandStreamHandle {
        self.handle
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn aux(&self) -> &AuxArena {
        &self.aux
    }

    /// 常量块中已写入的数据
    pub fn constant_block(&self) -> Option<&[u8]> {
        self.constant_block.as_ref().map(|b| &b.data[..b.cursor])
    }

    /// 回卷命令与辅助内存，不释放底层存储
    pub fn reset(&mut self) {
        self.commands.clear();
        self.aux.reset();
        if let Some(block) = &mut self.constant_block {
            block.cursor = 0;
        }
        self.in_render_pass = false;
        self.label_depth = 0;
    }

    /// 追加一条命令
    pub fn record(&mut self, command: Command) {
        if self.commands.len() >= self.capacity {
            gpu_fatal!(
                "Command stream {:?} is full: capacity {} reached while recording {}",
                self.handle,
                self.capacity,
                command.kind().name()
            );
        }
        self.commands.push(command);
    }

    /// 在辅助内存中分配变长负载
    pub fn allocate_aux<T: bytemuck::Pod>(&mut self, data: &[T]) -> AuxSlice<T> {
        self.aux.alloc_slice(data)
    }

    /// 写入常量块，返回写入位置的偏移
    ///
    /// 仅在创建时声明了常量块的命令流上可用。
    pub fn write_to_constant_block(&mut self, data: &[u8]) -> u32 {
        let handle = self.handle;
        let Some(block) = &mut self.constant_block else {
            gpu_fatal!("Command stream {:?} was created without a constant block", handle);
        };

        let end = block.cursor + data.len();
        if end > block.data.len() {
            gpu_fatal!(
                "Constant block of command stream {:?} exhausted: {} + {} > {}",
                handle,
                block.cursor,
                data.len(),
                block.data.len()
            );
        }

        let offset = block.cursor;
        block.data[offset..end].copy_from_slice(data);
        // 与 D3D12 根常量 / Metal setBytes 的 4 字节粒度对齐
        block.cursor = end.next_multiple_of(4).min(block.data.len());
        offset as u32
    }

    pub fn is_in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    // ---- 录制接口 ----

    pub fn begin_render_pass(
        &mut self,
        colors: &[ColorAttachment],
        depth: Option<DepthAttachment>,
        render_area: Scissor,
    ) {
        debug_assert!(!self.in_render_pass, "render passes cannot nest");
        let colors = self.aux.alloc_slice(colors);
        self.record(Command::BeginRenderPass { colors, depth, render_area });
        self.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self) {
        debug_assert!(self.in_render_pass, "end_render_pass without begin_render_pass");
        self.record(Command::EndRenderPass);
        self.in_render_pass = false;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: Scissor) {
        self.record(Command::SetScissor(scissor));
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.record(Command::BindPipeline(pipeline));
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, bindings: &[VertexBufferBinding]) {
        let bindings = self.aux.alloc_slice(bindings);
        self.record(Command::BindVertexBuffers { first_binding, bindings });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.record(Command::BindIndexBuffer { buffer, offset, index_type });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record(Command::Draw(DrawArgs {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        }));
    }

    pub fn draw_indexed(&mut self, args: DrawIndexedArgs) {
        self.record(Command::DrawIndexed(args));
    }

    pub fn draw_indirect(&mut self, args: IndirectArgs) {
        self.record(Command::DrawIndirect(args));
    }

    pub fn draw_indexed_indirect(&mut self, args: IndirectArgs) {
        self.record(Command::DrawIndexedIndirect(args));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::Dispatch { x, y, z });
    }

    pub fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        self.record(Command::DispatchIndirect { buffer, offset });
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]) {
        let regions = self.aux.alloc_slice(regions);
        self.record(Command::CopyBuffer { src, dst, regions });
    }

    pub fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, regions: &[TextureCopyRegion]) {
        let regions = self.aux.alloc_slice(regions);
        self.record(Command::CopyTexture { src, dst, regions });
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: BufferHandle,
        dst: TextureHandle,
        regions: &[BufferTextureCopyRegion],
    ) {
        let regions = self.aux.alloc_slice(regions);
        self.record(Command::CopyBufferToTexture { src, dst, regions });
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        src: TextureHandle,
        dst: BufferHandle,
        regions: &[BufferTextureCopyRegion],
    ) {
        let regions = self.aux.alloc_slice(regions);
        self.record(Command::CopyTextureToBuffer { src, dst, regions });
    }

    /// 通过内部暂存缓冲区把 `data` 写入 GPU 缓冲区
    pub fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        let data = self.aux.alloc_slice(data);
        self.record(Command::UpdateBuffer { dst, offset, data });
    }

    /// 通过内部暂存缓冲区上传纹理数据（`region.buffer_offset` 被忽略）
    ///
    /// 与 `copy_buffer_to_texture` 一样，目标纹理需要处于 `CopyDst` 状态。
    pub fn upload_texture(&mut self, dst: TextureHandle, region: BufferTextureCopyRegion, data: &[u8]) {
        let data = self.aux.alloc_slice(data);
        self.record(Command::UploadTexture { dst, region, data });
    }

    pub fn bind_descriptor_set(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        self.record(Command::BindDescriptorSet { bind_point, layout, set_index, set });
    }

    pub fn push_constants(&mut self, layout: PipelineLayoutHandle, stages: ShaderStages, offset: u32, data: &[u8]) {
        let data = PushConstantData::Inline(self.aux.alloc_slice(data));
        self.record(Command::PushConstants { layout, stages, offset, data });
    }

    /// 使用常量块中 `[block_offset, block_offset + size)` 的数据作为推送常量
    pub fn push_constants_from_block(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        block_offset: u32,
        size: u32,
    ) {
        let data = PushConstantData::ConstantBlock { offset: block_offset, size };
        self.record(Command::PushConstants { layout, stages, offset, data });
    }

    pub fn resource_barrier(&mut self, textures: &[TextureBarrier], buffers: &[BufferBarrier]) {
        let textures = self.aux.alloc_slice(textures);
        let buffers = self.aux.alloc_slice(buffers);
        self.record(Command::ResourceBarrier { textures, buffers });
    }

    /// 执行一个已关闭的二级命令流
    pub fn execute_secondary(&mut self, secondary: &CommandStream) {
        debug_assert_eq!(secondary.queue_type(), QueueType::Secondary);
        self.record(Command::ExecuteSecondary(secondary.handle()));
    }

    pub fn begin_debug_label(&mut self, name: &str, color: [f32; 4]) {
        let name = self.aux.alloc_slice(name.as_bytes());
        self.record(Command::BeginDebugLabel { name, color });
        self.label_depth += 1;
    }

    pub fn end_debug_label(&mut self) {
        debug_assert!(self.label_depth > 0, "end_debug_label without begin_debug_label");
        self.record(Command::EndDebugLabel);
        self.label_depth = self.label_depth.saturating_sub(1);
    }

    /// 本命令流写入的纹理（渲染目标、拷贝 / 上传目标、屏障对象）
    pub(crate) fn written_textures(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.commands.iter().flat_map(move |command| {
            let textures: Vec<TextureHandle> = match command {
                Command::BeginRenderPass { colors, .. } => {
                    self.aux.get(*colors).iter().map(|c| c.texture).collect()
                }
                Command::CopyTexture { dst, .. }
                | Command::CopyBufferToTexture { dst, .. }
                | Command::UploadTexture { dst, .. } => vec![*dst],
                Command::ResourceBarrier { textures, .. } => {
                    self.aux.get(*textures).iter().map(|b| b.texture).collect()
                }
                _ => Vec::new(),
            };
            textures
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(capacity: u32) -> CommandStream {
        CommandStream::new(
            CommandStreamHandle::from_raw(0),
            &CommandStreamDesc {
                queue_type: QueueType::Graphics,
                command_capacity: capacity,
                aux_memory_bytes: 1024,
                constant_block_bytes: 64,
            },
        )
    }

    #[test]
    fn test_record_keeps_order() {
        let mut s = stream(8);
        s.set_viewport(Viewport::new(800.0, 600.0));
        s.dispatch(1, 2, 3);
        s.draw(3, 1, 0, 0);

        let kinds: Vec<_> = s.commands().iter().map(Command::kind).collect();
        assert_eq!(kinds, vec![CommandKind::SetViewport, CommandKind::Dispatch, CommandKind::Draw]);
    }

    #[test]
    fn test_reset_rewinds_everything() {
        let mut s = stream(4);
        s.copy_buffer(
            BufferHandle::from_raw(0),
            BufferHandle::from_raw(1),
            &[BufferCopyRegion { src_offset: 0, dst_offset: 0, size: 16 }],
        );
        s.write_to_constant_block(&[1, 2, 3, 4]);
        assert!(s.aux().used_bytes() > 0);

        s.reset();
        assert!(s.is_empty());
        assert_eq!(s.aux().used_bytes(), 0);
        assert_eq!(s.constant_block(), Some(&[][..]));
        assert_eq!(s.capacity(), 4);
    }

    #[test]
    #[should_panic(expected = "is full")]
    fn test_overflow_is_fatal() {
        let mut s = stream(2);
        s.dispatch(1, 1, 1);
        s.dispatch(1, 1, 1);
        s.dispatch(1, 1, 1);
    }

    #[test]
    fn test_constant_block_offsets_are_aligned() {
        let mut s = stream(4);
        assert_eq!(s.write_to_constant_block(&[1, 2, 3]), 0);
        assert_eq!(s.write_to_constant_block(&[4, 5, 6, 7]), 4);
        assert_eq!(s.constant_block().map(<[u8]>::len), Some(8));
    }

    #[test]
    #[should_panic(expected = "without a constant block")]
    fn test_constant_block_missing_is_fatal() {
        let mut s = CommandStream::new(
            CommandStreamHandle::from_raw(1),
            &CommandStreamDesc {
                queue_type: QueueType::Compute,
                command_capacity: 4,
                aux_memory_bytes: 0,
                constant_block_bytes: 0,
            },
        );
        s.write_to_constant_block(&[0; 4]);
    }

    #[test]
    fn test_written_textures() {
        let mut s = stream(8);
        let target = TextureHandle::from_raw(5);
        s.begin_render_pass(
            &[ColorAttachment::new(target, LoadOp::Clear, StoreOp::Store)],
            None,
            Scissor::new(4, 4),
        );
        s.end_render_pass();
        s.upload_texture(TextureHandle::from_raw(9), BufferTextureCopyRegion::full_2d(1, 1), &[0; 4]);

        let written: Vec<_> = s.written_textures().collect();
        assert_eq!(written, vec![target, TextureHandle::from_raw(9)]);
    }
}
