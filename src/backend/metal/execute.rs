//! 录制好的操作在提交时编码进 `MTLCommandBuffer`
//!
//! Metal 的编码器（渲染 / 计算 / 拷贝）互斥，而绑定状态属于编码器。执行器记录
//! 当前生效的绑定，每当切换到新编码器时重新下发。

use ::metal::*;
use std::ffi::c_void;
use tracing::{error, warn};

use super::pipeline::{Argument, BoundArgument, PUSH_CONSTANT_BUFFER_INDEX};
use crate::command::{BufferCopyRegion, BufferTextureCopyRegion, DrawArgs, DrawIndexedArgs, Scissor, TextureCopyRegion, Viewport};
use crate::shader::ShaderStages;

#[derive(Clone)]
pub(super) struct ColorTarget {
    pub texture: Texture,
    pub load: MTLLoadAction,
    pub store: MTLStoreAction,
    pub clear: [f32; 4],
}

#[derive(Clone)]
pub(super) struct DepthTarget {
    pub texture: Texture,
    pub load: MTLLoadAction,
    pub store: MTLStoreAction,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub stencil: bool,
}

/// 缓冲区与纹理之间的一次拷贝，行距已按格式算好
#[derive(Clone, Copy)]
pub(super) struct BufferImageCopy {
    pub region: BufferTextureCopyRegion,
    pub bytes_per_row: u64,
    pub bytes_per_image: u64,
}

#[derive(Clone)]
pub(super) struct RenderBind {
    pub pipeline: RenderPipelineState,
    pub depth_stencil: Option<DepthStencilState>,
    pub cull: MTLCullMode,
    pub winding: MTLWinding,
    pub primitive: MTLPrimitiveType,
}

#[derive(Clone)]
pub(super) enum Op {
    BeginRenderPass { colors: Vec<ColorTarget>, depth: Option<DepthTarget>, area: Scissor },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(Scissor),
    BindRenderPipeline(RenderBind),
    BindComputePipeline { pipeline: ComputePipelineState, threads: MTLSize },
    SetVertexBuffer { index: u64, buffer: Buffer, offset: u64 },
    SetIndexBuffer { buffer: Buffer, offset: u64, ty: MTLIndexType, size: u64 },
    Draw(DrawArgs),
    DrawIndexed(DrawIndexedArgs),
    DrawIndirect { buffer: Buffer, offset: u64, count: u32, stride: u64, indexed: bool },
    Dispatch(MTLSize),
    DispatchIndirect { buffer: Buffer, offset: u64 },
    CopyBuffer { src: Buffer, dst: Buffer, regions: Vec<BufferCopyRegion> },
    CopyTexture { src: Texture, dst: Texture, regions: Vec<TextureCopyRegion> },
    CopyBufferToTexture { src: Buffer, dst: Texture, copies: Vec<BufferImageCopy> },
    CopyTextureToBuffer { src: Texture, dst: Buffer, copies: Vec<BufferImageCopy> },
    BindArguments(Vec<BoundArgument>),
    PushConstants { stages: ShaderStages, offset: u32, data: Vec<u8> },
    PushDebugGroup(String),
    PopDebugGroup,
}

#[derive(Clone, Copy)]
enum Active<'c> {
    None,
    Render(&'c RenderCommandEncoderRef),
    Compute(&'c ComputeCommandEncoderRef),
    Blit(&'c BlitCommandEncoderRef),
}

fn origin(offset: [i32; 3]) -> MTLOrigin {
    MTLOrigin {
        x: offset[0].max(0) as u64,
        y: offset[1].max(0) as u64,
        z: offset[2].max(0) as u64,
    }
}

fn size(extent: [u32; 3]) -> MTLSize {
    MTLSize::new(u64::from(extent[0]), u64::from(extent[1]), u64::from(extent[2].max(1)))
}

/// 一次提交内的编码状态
pub(super) struct Executor<'c> {
    command_buffer: &'c CommandBufferRef,
    active: Active<'c>,
    render: Option<RenderBind>,
    compute: Option<(ComputePipelineState, MTLSize)>,
    vertex_buffers: Vec<(u64, Buffer, u64)>,
    index_buffer: Option<(Buffer, u64, MTLIndexType, u64)>,
    arguments: Vec<BoundArgument>,
    push_constants: Vec<u8>,
    push_stages: ShaderStages,
    /// 当前编码器上打开的调试组
    encoder_groups: u32,
    /// 命令缓冲区上打开的调试组
    buffer_groups: u32,
    deferred_pops: u32,
}

impl<'c> Executor<'c> {
    pub fn new(command_buffer: &'c CommandBufferRef) -> Self {
        Self {
            command_buffer,
            active: Active::None,
            render: None,
            compute: None,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            arguments: Vec::new(),
            push_constants: Vec::new(),
            push_stages: ShaderStages::empty(),
            encoder_groups: 0,
            buffer_groups: 0,
            deferred_pops: 0,
        }
    }

    /// 每个命令列表开始时绑定状态清空
    pub fn reset_bindings(&mut self) {
        self.end_encoder();
        self.render = None;
        self.compute = None;
        self.vertex_buffers.clear();
        self.index_buffer = None;
        self.arguments.clear();
        self.push_constants.clear();
        self.push_stages = ShaderStages::empty();
    }

    pub fn finish(mut self) {
        self.end_encoder();
        for _ in 0..self.buffer_groups {
            self.command_buffer.pop_debug_group();
        }
    }

    fn end_encoder(&mut self) {
        let encoder: Option<&CommandEncoderRef> = match self.active {
            Active::None => None,
            Active::Render(e) => Some(&**e),
            Active::Compute(e) => Some(&**e),
            Active::Blit(e) => Some(&**e),
        };
        if let Some(encoder) = encoder {
            for _ in 0..self.encoder_groups {
                encoder.pop_debug_group();
            }
            encoder.end_encoding();
        }
        self.encoder_groups = 0;
        self.active = Active::None;
        for _ in 0..self.deferred_pops.min(self.buffer_groups) {
            self.command_buffer.pop_debug_group();
            self.buffer_groups -= 1;
        }
        self.deferred_pops = 0;
    }

    fn compute_encoder(&mut self) -> Option<&'c ComputeCommandEncoderRef> {
        match self.active {
            Active::Compute(encoder) => return Some(encoder),
            Active::Render(_) => {
                error!("Compute work inside a render pass, command skipped");
                return None;
            }
            Active::Blit(_) | Active::None => self.end_encoder(),
        }
        let encoder = self.command_buffer.new_compute_command_encoder();
        self.active = Active::Compute(encoder);
        if let Some((pipeline, _)) = &self.compute {
            encoder.set_compute_pipeline_state(pipeline);
        }
        for bound in &self.arguments {
            bind_compute(encoder, bound);
        }
        self.apply_push_constants();
        Some(encoder)
    }

    fn blit_encoder(&mut self) -> Option<&'c BlitCommandEncoderRef> {
        match self.active {
            Active::Blit(encoder) => return Some(encoder),
            Active::Render(_) => {
                error!("Copy inside a render pass, command skipped");
                return None;
            }
            Active::Compute(_) | Active::None => self.end_encoder(),
        }
        let encoder = self.command_buffer.new_blit_command_encoder();
        self.active = Active::Blit(encoder);
        Some(encoder)
    }

    fn apply_render_state(&self, encoder: &RenderCommandEncoderRef) {
        if let Some(bind) = &self.render {
            encoder.set_render_pipeline_state(&bind.pipeline);
            if let Some(depth_stencil) = &bind.depth_stencil {
                encoder.set_depth_stencil_state(depth_stencil);
            }
            encoder.set_cull_mode(bind.cull);
            encoder.set_front_facing_winding(bind.winding);
        }
    }

    fn apply_push_constants(&self) {
        if self.push_constants.is_empty() {
            return;
        }
        let len = self.push_constants.len() as u64;
        let bytes = self.push_constants.as_ptr() as *const c_void;
        match self.active {
            Active::Render(encoder) => {
                if self.push_stages.contains(ShaderStages::VERTEX) {
                    encoder.set_vertex_bytes(PUSH_CONSTANT_BUFFER_INDEX, len, bytes);
                }
                if self.push_stages.contains(ShaderStages::FRAGMENT) {
                    encoder.set_fragment_bytes(PUSH_CONSTANT_BUFFER_INDEX, len, bytes);
                }
            }
            Active::Compute(encoder) => {
                if self.push_stages.contains(ShaderStages::COMPUTE) {
                    encoder.set_bytes(PUSH_CONSTANT_BUFFER_INDEX, len, bytes);
                }
            }
            _ => {}
        }
    }

    fn render_encoder(&self) -> Option<&'c RenderCommandEncoderRef> {
        match self.active {
            Active::Render(encoder) => Some(encoder),
            _ => {
                error!("Draw outside a render pass, command skipped");
                None
            }
        }
    }

    fn index_buffer(&self) -> Option<(Buffer, u64, MTLIndexType, u64)> {
        let index = self.index_buffer.clone();
        if index.is_none() {
            error!("Indexed draw without an index buffer, command skipped");
        }
        index
    }

    fn primitive(&self) -> MTLPrimitiveType {
        self.render.as_ref().map_or(MTLPrimitiveType::Triangle, |bind| bind.primitive)
    }

    pub fn execute(&mut self, op: &Op) {
        match op {
            Op::BeginRenderPass { colors, depth, area } => {
                self.end_encoder();
                let descriptor = RenderPassDescriptor::new();
                for (i, color) in colors.iter().enumerate() {
                    let Some(attachment) = descriptor.color_attachments().object_at(i as u64) else {
                        error!(index = i, "Color attachment index out of range");
                        continue;
                    };
                    attachment.set_texture(Some(&color.texture));
                    attachment.set_load_action(color.load);
                    attachment.set_store_action(color.store);
                    let [r, g, b, a] = color.clear;
                    attachment.set_clear_color(MTLClearColor::new(f64::from(r), f64::from(g), f64::from(b), f64::from(a)));
                }
                if let Some(depth) = depth {
                    if let Some(attachment) = descriptor.depth_attachment() {
                        attachment.set_texture(Some(&depth.texture));
                        attachment.set_load_action(depth.load);
                        attachment.set_store_action(depth.store);
                        attachment.set_clear_depth(f64::from(depth.clear_depth));
                    }
                    if depth.stencil {
                        if let Some(attachment) = descriptor.stencil_attachment() {
                            attachment.set_texture(Some(&depth.texture));
                            attachment.set_load_action(depth.load);
                            attachment.set_store_action(depth.store);
                            attachment.set_clear_stencil(depth.clear_stencil);
                        }
                    }
                }

                let encoder = self.command_buffer.new_render_command_encoder(descriptor);
                self.active = Active::Render(encoder);
                encoder.set_viewport(MTLViewport {
                    originX: f64::from(area.x),
                    originY: f64::from(area.y),
                    width: f64::from(area.width),
                    height: f64::from(area.height),
                    znear: 0.0,
                    zfar: 1.0,
                });
                self.apply_render_state(encoder);
                for (index, buffer, offset) in &self.vertex_buffers {
                    encoder.set_vertex_buffer(*index, Some(buffer), *offset);
                }
                for bound in &self.arguments {
                    bind_render(encoder, bound);
                }
                self.apply_push_constants();
            }
            Op::EndRenderPass => {
                if matches!(self.active, Active::Render(_)) {
                    self.end_encoder();
                }
            }
            Op::SetViewport(viewport) => {
                if let Some(encoder) = self.render_encoder() {
                    encoder.set_viewport(MTLViewport {
                        originX: f64::from(viewport.x),
                        originY: f64::from(viewport.y),
                        width: f64::from(viewport.width),
                        height: f64::from(viewport.height),
                        znear: f64::from(viewport.min_depth),
                        zfar: f64::from(viewport.max_depth),
                    });
                }
            }
            Op::SetScissor(scissor) => {
                if let Some(encoder) = self.render_encoder() {
                    encoder.set_scissor_rect(MTLScissorRect {
                        x: scissor.x.max(0) as u64,
                        y: scissor.y.max(0) as u64,
                        width: u64::from(scissor.width),
                        height: u64::from(scissor.height),
                    });
                }
            }
            Op::BindRenderPipeline(bind) => {
                self.render = Some(bind.clone());
                if let Active::Render(encoder) = self.active {
                    self.apply_render_state(encoder);
                }
            }
            Op::BindComputePipeline { pipeline, threads } => {
                self.compute = Some((pipeline.clone(), *threads));
                if let Active::Compute(encoder) = self.active {
                    encoder.set_compute_pipeline_state(pipeline);
                }
            }
            Op::SetVertexBuffer { index, buffer, offset } => {
                self.vertex_buffers.retain(|(i, _, _)| i != index);
                self.vertex_buffers.push((*index, buffer.clone(), *offset));
                if let Active::Render(encoder) = self.active {
                    encoder.set_vertex_buffer(*index, Some(buffer), *offset);
                }
            }
            Op::SetIndexBuffer { buffer, offset, ty, size } => {
                self.index_buffer = Some((buffer.clone(), *offset, *ty, *size));
            }
            Op::Draw(args) => {
                if let Some(encoder) = self.render_encoder() {
                    encoder.draw_primitives_instanced_base_instance(
                        self.primitive(),
                        u64::from(args.first_vertex),
                        u64::from(args.vertex_count),
                        u64::from(args.instance_count),
                        u64::from(args.first_instance),
                    );
                }
            }
            Op::DrawIndexed(args) => {
                let Some(encoder) = self.render_encoder() else {
                    return;
                };
                let Some((buffer, offset, ty, size)) = self.index_buffer() else {
                    return;
                };
                encoder.draw_indexed_primitives_instanced_base_instance(
                    self.primitive(),
                    u64::from(args.index_count),
                    ty,
                    &buffer,
                    offset + u64::from(args.first_index) * size,
                    u64::from(args.instance_count),
                    i64::from(args.vertex_offset),
                    u64::from(args.first_instance),
                );
            }
            Op::DrawIndirect { buffer, offset, count, stride, indexed } => {
                let Some(encoder) = self.render_encoder() else {
                    return;
                };
                let index = if *indexed {
                    match self.index_buffer() {
                        Some(index) => Some(index),
                        None => return,
                    }
                } else {
                    None
                };
                for i in 0..u64::from(*count) {
                    let draw_offset = offset + i * stride;
                    match &index {
                        Some((index_buffer, index_offset, ty, _)) => encoder.draw_indexed_primitives_indirect(
                            self.primitive(),
                            *ty,
                            index_buffer,
                            *index_offset,
                            buffer,
                            draw_offset,
                        ),
                        None => encoder.draw_primitives_indirect(self.primitive(), buffer, draw_offset),
                    }
                }
            }
            Op::Dispatch(groups) => {
                let Some(encoder) = self.compute_encoder() else {
                    return;
                };
                let Some((_, threads)) = &self.compute else {
                    error!("Dispatch without a compute pipeline, command skipped");
                    return;
                };
                encoder.dispatch_thread_groups(*groups, *threads);
            }
            Op::DispatchIndirect { buffer, offset } => {
                let Some(encoder) = self.compute_encoder() else {
                    return;
                };
                let Some((_, threads)) = &self.compute else {
                    error!("Dispatch without a compute pipeline, command skipped");
                    return;
                };
                encoder.dispatch_thread_groups_indirect(buffer, *offset, *threads);
            }
            Op::CopyBuffer { src, dst, regions } => {
                if let Some(encoder) = self.blit_encoder() {
                    for region in regions {
                        encoder.copy_from_buffer(src, region.src_offset, dst, region.dst_offset, region.size);
                    }
                }
            }
            Op::CopyTexture { src, dst, regions } => {
                if let Some(encoder) = self.blit_encoder() {
                    for region in regions {
                        encoder.copy_from_texture(
                            src,
                            u64::from(region.src_layer),
                            u64::from(region.src_mip),
                            origin(region.src_offset),
                            size(region.extent),
                            dst,
                            u64::from(region.dst_layer),
                            u64::from(region.dst_mip),
                            origin(region.dst_offset),
                        );
                    }
                }
            }
            Op::CopyBufferToTexture { src, dst, copies } => {
                if let Some(encoder) = self.blit_encoder() {
                    for copy in copies {
                        encoder.copy_from_buffer_to_texture(
                            src,
                            copy.region.buffer_offset,
                            copy.bytes_per_row,
                            copy.bytes_per_image,
                            size(copy.region.extent),
                            dst,
                            u64::from(copy.region.array_layer),
                            u64::from(copy.region.mip_level),
                            origin(copy.region.offset),
                            MTLBlitOption::empty(),
                        );
                    }
                }
            }
            Op::CopyTextureToBuffer { src, dst, copies } => {
                if let Some(encoder) = self.blit_encoder() {
                    for copy in copies {
                        encoder.copy_from_texture_to_buffer(
                            src,
                            u64::from(copy.region.array_layer),
                            u64::from(copy.region.mip_level),
                            origin(copy.region.offset),
                            size(copy.region.extent),
                            dst,
                            copy.region.buffer_offset,
                            copy.bytes_per_row,
                            copy.bytes_per_image,
                            MTLBlitOption::empty(),
                        );
                    }
                }
            }
            Op::BindArguments(arguments) => {
                for bound in arguments {
                    self.arguments.retain(|existing| !same_slot(&existing.argument, &bound.argument));
                    self.arguments.push(bound.clone());
                    match self.active {
                        Active::Render(encoder) => bind_render(encoder, bound),
                        Active::Compute(encoder) => bind_compute(encoder, bound),
                        _ => {}
                    }
                }
            }
            Op::PushConstants { stages, offset, data } => {
                let end = *offset as usize + data.len();
                if self.push_constants.len() < end {
                    self.push_constants.resize(end, 0);
                }
                self.push_constants[*offset as usize..end].copy_from_slice(data);
                self.push_stages |= *stages;
                self.apply_push_constants();
            }
            Op::PushDebugGroup(name) => match self.active {
                Active::Render(e) => {
                    e.push_debug_group(name);
                    self.encoder_groups += 1;
                }
                Active::Compute(e) => {
                    e.push_debug_group(name);
                    self.encoder_groups += 1;
                }
                Active::Blit(e) => {
                    e.push_debug_group(name);
                    self.encoder_groups += 1;
                }
                Active::None => {
                    self.command_buffer.push_debug_group(name);
                    self.buffer_groups += 1;
                }
            },
            Op::PopDebugGroup => {
                let encoder: Option<&CommandEncoderRef> = match self.active {
                    Active::None => None,
                    Active::Render(e) => Some(&**e),
                    Active::Compute(e) => Some(&**e),
                    Active::Blit(e) => Some(&**e),
                };
                match encoder {
                    Some(encoder) if self.encoder_groups > 0 => {
                        encoder.pop_debug_group();
                        self.encoder_groups -= 1;
                    }
                    // 命令缓冲区上的组要等当前编码器结束后才能关闭
                    Some(_) => self.deferred_pops += 1,
                    None if self.buffer_groups > 0 => {
                        self.command_buffer.pop_debug_group();
                        self.buffer_groups -= 1;
                    }
                    None => warn!("Debug label ended without a matching begin"),
                }
            }
        }
    }
}

fn same_slot(a: &Argument, b: &Argument) -> bool {
    match (a, b) {
        (Argument::Buffer { index: x, .. }, Argument::Buffer { index: y, .. }) => x == y,
        (Argument::Texture { index: x, .. }, Argument::Texture { index: y, .. }) => x == y,
        (Argument::Sampler { index: x, .. }, Argument::Sampler { index: y, .. }) => x == y,
        _ => false,
    }
}

fn bind_render(encoder: &RenderCommandEncoderRef, bound: &BoundArgument) {
    let vertex = bound.stages.contains(ShaderStages::VERTEX);
    let fragment = bound.stages.contains(ShaderStages::FRAGMENT);
    match &bound.argument {
        Argument::Buffer { index, buffer, offset } => {
            if vertex {
                encoder.set_vertex_buffer(*index, Some(buffer), *offset);
            }
            if fragment {
                encoder.set_fragment_buffer(*index, Some(buffer), *offset);
            }
        }
        Argument::Texture { index, texture } => {
            if vertex {
                encoder.set_vertex_texture(*index, Some(texture));
            }
            if fragment {
                encoder.set_fragment_texture(*index, Some(texture));
            }
        }
        Argument::Sampler { index, sampler } => {
            if vertex {
                encoder.set_vertex_sampler_state(*index, Some(sampler));
            }
            if fragment {
                encoder.set_fragment_sampler_state(*index, Some(sampler));
            }
        }
    }
}

fn bind_compute(encoder: &ComputeCommandEncoderRef, bound: &BoundArgument) {
    if !bound.stages.contains(ShaderStages::COMPUTE) {
        return;
    }
    match &bound.argument {
        Argument::Buffer { index, buffer, offset } => encoder.set_buffer(*index, Some(buffer), *offset),
        Argument::Texture { index, texture } => encoder.set_texture(*index, Some(texture)),
        Argument::Sampler { index, sampler } => encoder.set_sampler_state(*index, Some(sampler)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_offsets_clamp_to_origin() {
        let o = origin([-4, 2, 0]);
        assert_eq!((o.x, o.y, o.z), (0, 2, 0));
    }

    #[test]
    fn test_flat_extent_has_unit_depth() {
        let s = size([8, 4, 0]);
        assert_eq!((s.width, s.height, s.depth), (8, 4, 1));
    }
}
