//! 命令记录使用的定长数据结构
//!
//! 需要放进辅助内存的记录（拷贝区域、屏障、附件等）都是 `Pod`，
//! 字段顺序与显式填充保证没有隐式 padding。

use bytemuck::{Pod, Zeroable};

use crate::handle::{BufferHandle, TextureHandle};

/// 资源状态
///
/// 屏障在两个状态之间转换；后端把它映射为各自的布局 / 访问掩码 / 资源状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceState {
    Undefined = 0,
    Common,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    ShaderRead,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySrc,
    CopyDst,
    IndirectArgument,
    Present,
}

impl ResourceState {
    const ALL: [ResourceState; 14] = [
        ResourceState::Undefined,
        ResourceState::Common,
        ResourceState::VertexBuffer,
        ResourceState::IndexBuffer,
        ResourceState::ConstantBuffer,
        ResourceState::ShaderRead,
        ResourceState::UnorderedAccess,
        ResourceState::RenderTarget,
        ResourceState::DepthWrite,
        ResourceState::DepthRead,
        ResourceState::CopySrc,
        ResourceState::CopyDst,
        ResourceState::IndirectArgument,
        ResourceState::Present,
    ];

    pub fn from_raw(raw: u32) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(ResourceState::Common)
    }
}

/// 附件加载操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LoadOp {
    Load = 0,
    Clear = 1,
    DontCare = 2,
}

impl LoadOp {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => LoadOp::Load,
            1 => LoadOp::Clear,
            _ => LoadOp::DontCare,
        }
    }
}

/// 附件存储操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StoreOp {
    Store = 0,
    DontCare = 1,
}

impl StoreOp {
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 { StoreOp::Store } else { StoreOp::DontCare }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// 管线绑定点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

/// 颜色附件
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    load_op: u32,
    store_op: u32,
    _pad: u32,
    pub clear_color: [f32; 4],
}

impl ColorAttachment {
    pub fn new(texture: TextureHandle, load_op: LoadOp, store_op: StoreOp) -> Self {
        Self {
            texture,
            load_op: load_op as u32,
            store_op: store_op as u32,
            _pad: 0,
            clear_color: [0.0; 4],
        }
    }

    pub fn with_clear(mut self, color: [f32; 4]) -> Self {
        self.load_op = LoadOp::Clear as u32;
        self.clear_color = color;
        self
    }

    pub fn load_op(&self) -> LoadOp {
        LoadOp::from_raw(self.load_op)
    }

    pub fn store_op(&self) -> StoreOp {
        StoreOp::from_raw(self.store_op)
    }
}

/// 深度附件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { x: 0.0, y: 0.0, width, height, min_depth: 0.0, max_depth: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scissor {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Scissor {
    pub fn new(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectArgs {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub draw_count: u32,
    pub stride: u32,
}

/// 顶点缓冲绑定
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    _pad: u32,
    pub offset: u64,
}

impl VertexBufferBinding {
    pub fn new(buffer: BufferHandle, offset: u64) -> Self {
        Self { buffer, _pad: 0, offset }
    }
}

/// 缓冲区之间的拷贝区域
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// 纹理之间的拷贝区域
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureCopyRegion {
    pub src_mip: u32,
    pub src_layer: u32,
    pub dst_mip: u32,
    pub dst_layer: u32,
    pub src_offset: [i32; 3],
    pub dst_offset: [i32; 3],
    pub extent: [u32; 3],
}

/// 缓冲区与纹理之间的拷贝区域
///
/// `row_length` / `image_height` 为 0 表示紧密排列。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferTextureCopyRegion {
    pub buffer_offset: u64,
    pub row_length: u32,
    pub image_height: u32,
    pub mip_level: u32,
    pub array_layer: u32,
    pub offset: [i32; 3],
    pub extent: [u32; 3],
}

impl BufferTextureCopyRegion {
    /// 覆盖整个 2D mip 0 的紧密排列区域
    pub fn full_2d(width: u32, height: u32) -> Self {
        Self {
            buffer_offset: 0,
            row_length: 0,
            image_height: 0,
            mip_level: 0,
            array_layer: 0,
            offset: [0; 3],
            extent: [width, height, 1],
        }
    }
}

/// 纹理状态转换
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureBarrier {
    pub texture: TextureHandle,
    before: u32,
    after: u32,
    pub base_mip: u16,
    pub mip_count: u16,
    pub base_layer: u16,
    pub layer_count: u16,
}

impl TextureBarrier {
    /// 覆盖全部 mip 与数组层的转换
    pub fn new(texture: TextureHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            texture,
            before: before as u32,
            after: after as u32,
            base_mip: 0,
            mip_count: u16::MAX,
            base_layer: 0,
            layer_count: u16::MAX,
        }
    }

    pub fn before(&self) -> ResourceState {
        ResourceState::from_raw(self.before)
    }

    pub fn after(&self) -> ResourceState {
        ResourceState::from_raw(self.after)
    }
}

/// 缓冲区状态转换，`size == u64::MAX` 表示整个缓冲区
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    before: u32,
    after: u32,
    _pad: u32,
    pub offset: u64,
    pub size: u64,
}

impl BufferBarrier {
    pub fn new(buffer: BufferHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            buffer,
            before: before as u32,
            after: after as u32,
            _pad: 0,
            offset: 0,
            size: u64::MAX,
        }
    }

    pub fn before(&self) -> ResourceState {
        ResourceState::from_raw(self.before)
    }

    pub fn after(&self) -> ResourceState {
        ResourceState::from_raw(self.after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layouts_have_no_padding() {
        assert_eq!(std::mem::size_of::<ColorAttachment>(), 32);
        assert_eq!(std::mem::size_of::<VertexBufferBinding>(), 16);
        assert_eq!(std::mem::size_of::<BufferTextureCopyRegion>(), 48);
        assert_eq!(std::mem::size_of::<BufferBarrier>(), 32);
        assert_eq!(std::mem::size_of::<TextureBarrier>(), 20);
    }

    #[test]
    fn test_state_round_trip_through_raw() {
        let barrier = TextureBarrier::new(
            TextureHandle::from_raw(3),
            ResourceState::CopyDst,
            ResourceState::ShaderRead,
        );
        assert_eq!(barrier.before(), ResourceState::CopyDst);
        assert_eq!(barrier.after(), ResourceState::ShaderRead);
        assert_eq!(ResourceState::from_raw(ResourceState::Present as u32), ResourceState::Present);
    }

    #[test]
    fn test_clear_sets_load_op() {
        let att = ColorAttachment::new(TextureHandle::from_raw(0), LoadOp::Load, StoreOp::Store)
            .with_clear([0.1, 0.2, 0.3, 1.0]);
        assert_eq!(att.load_op(), LoadOp::Clear);
        assert_eq!(att.store_op(), StoreOp::Store);
    }
}
