//! Vulkan 命令编码
//!
//! 渲染通道使用动态渲染，屏障使用 synchronization2。交换链图像在第一次被写入时
//! 自动转换到所需布局，命令列表结束时转换回 `PRESENT_SRC_KHR`。

use ash::vk;
use std::ffi::CString;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

use super::convert::{self, StateInfo};
use super::{VulkanBackend, VulkanBuffer, VulkanSwapchain};
use crate::backend::{Backend, CommandListLevel, EncodeContext, TextureRef};
use crate::command::*;
use crate::core::error::Result;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle, TextureHandle,
};
use crate::resource::BufferDesc;
use crate::shader::ShaderStages;

/// 解析后的纹理
#[derive(Clone, Copy)]
struct Target<'a> {
    image: vk::Image,
    view: vk::ImageView,
    aspect: vk::ImageAspectFlags,
    swapchain: Option<(&'a VulkanSwapchain, u32)>,
}

pub struct VulkanEncoder<'a> {
    backend: &'a VulkanBackend,
    cmd: vk::CommandBuffer,
    ctx: EncodeContext<'a, VulkanBackend>,
    intermediates: Vec<VulkanBuffer>,
    /// 本命令列表中交换链图像的当前布局
    swapchain_layouts: Vec<(vk::Image, vk::ImageLayout)>,
    in_render_pass: bool,
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

fn extent_3d(extent: [u32; 3]) -> vk::Extent3D {
    vk::Extent3D { width: extent[0], height: extent[1], depth: extent[2].max(1) }
}

fn offset_3d(offset: [i32; 3]) -> vk::Offset3D {
    vk::Offset3D { x: offset[0], y: offset[1], z: offset[2] }
}

fn count_or_remaining(count: u16, remaining: u32) -> u32 {
    if count == u16::MAX {
        remaining
    } else {
        count as u32
    }
}

impl<'a> VulkanEncoder<'a> {
    pub(super) fn new(backend: &'a VulkanBackend, cmd: vk::CommandBuffer, ctx: EncodeContext<'a, VulkanBackend>) -> Self {
        Self {
            backend,
            cmd,
            ctx,
            intermediates: Vec::new(),
            swapchain_layouts: Vec::new(),
            in_render_pass: false,
        }
    }

    fn device(&self) -> &'a ash::Device {
        &self.backend.ctx.device
    }

    /// 把本列表写入过的交换链图像转换到呈现布局并结束录制
    pub(super) fn finish(mut self) -> Result<Vec<VulkanBuffer>> {
        if self.in_render_pass {
            warn!("Command list closed inside a render pass");
            unsafe { self.device().cmd_end_rendering(self.cmd) };
            self.in_render_pass = false;
        }

        if self.ctx.level() == CommandListLevel::Primary {
            let touched: Vec<(&'a VulkanSwapchain, u32)> = self.ctx.touched_swapchains().collect();
            for (swapchain, image) in touched {
                self.swapchain_to(swapchain, image, vk::ImageLayout::PRESENT_SRC_KHR);
            }
        }

        let result = unsafe { self.device().end_command_buffer(self.cmd) };
        match result {
            Ok(()) => Ok(self.intermediates),
            Err(e) => {
                for buffer in self.intermediates.drain(..) {
                    self.backend.destroy_buffer(buffer);
                }
                Err(super::vk_error("vkEndCommandBuffer")(e))
            }
        }
    }

    fn buffer(&self, handle: BufferHandle, command: CommandKind) -> Option<&'a VulkanBuffer> {
        let buffer = self.ctx.buffer(handle);
        if buffer.is_none() {
            error!(?handle, command = command.name(), "Invalid buffer handle, command skipped");
        }
        buffer
    }

    fn texture(&self, handle: TextureHandle, command: CommandKind) -> Option<Target<'a>> {
        let target = match self.ctx.texture(handle) {
            Some(TextureRef::Native(texture)) => Some(Target {
                image: texture.image,
                view: texture.view,
                aspect: texture.aspect,
                swapchain: None,
            }),
            Some(TextureRef::Swapchain { swapchain, image }) => {
                let index = image as usize;
                match (swapchain.images.get(index), swapchain.views.get(index)) {
                    (Some(&raw), Some(&view)) => Some(Target {
                        image: raw,
                        view,
                        aspect: vk::ImageAspectFlags::COLOR,
                        swapchain: Some((swapchain, image)),
                    }),
                    _ => None,
                }
            }
            None => None,
        };
        if target.is_none() {
            error!(?handle, command = command.name(), "Invalid texture handle, command skipped");
        }
        target
    }

    /// 交换链图像在本列表中的当前布局；第一次出现时根据帧标记推断
    fn swapchain_layout(&mut self, swapchain: &VulkanSwapchain, image: u32) -> vk::ImageLayout {
        let raw = swapchain.images[image as usize];
        if let Some((_, layout)) = self.swapchain_layouts.iter().find(|(i, _)| *i == raw) {
            return *layout;
        }

        // 同一帧里先关闭的命令列表已经写过这张图像，并把它留在了呈现布局
        let frame = self.ctx.frame();
        let initial = match swapchain.written.get(image as usize) {
            Some(written) if written.swap(frame, Ordering::AcqRel) == frame => vk::ImageLayout::PRESENT_SRC_KHR,
            _ => vk::ImageLayout::UNDEFINED,
        };
        self.swapchain_layouts.push((raw, initial));
        initial
    }

    fn swapchain_to(&mut self, swapchain: &VulkanSwapchain, image: u32, layout: vk::ImageLayout) {
        let current = self.swapchain_layout(swapchain, image);
        if current == layout {
            return;
        }
        let raw = swapchain.images[image as usize];
        let mut before = convert::layout_info(current);
        if matches!(current, vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR) {
            // 与获取信号量的等待阶段以及同帧更早的提交串联
            before.stage = vk::PipelineStageFlags2::ALL_COMMANDS;
        }
        let barrier = image_barrier(raw, COLOR_RANGE, before, convert::layout_info(layout));
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device().cmd_pipeline_barrier2(self.cmd, &dependency) };

        if let Some(entry) = self.swapchain_layouts.iter_mut().find(|(i, _)| *i == raw) {
            entry.1 = layout;
        }
    }

    /// 交换链目标在使用前转换布局，普通纹理按调用方的屏障
    fn prepare(&mut self, target: &Target<'a>, layout: vk::ImageLayout) {
        if let Some((swapchain, image)) = target.swapchain {
            self.swapchain_to(swapchain, image, layout);
        }
    }

    fn staging(&mut self, data: &[u8], command: CommandKind) -> Option<vk::Buffer> {
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
        let raw = staging.raw;
        self.intermediates.push(staging);
        Some(raw)
    }
}

fn image_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    before: StateInfo,
    after: StateInfo,
) -> vk::ImageMemoryBarrier2 {
    vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(before.stage)
        .src_access_mask(before.access)
        .dst_stage_mask(after.stage)
        .dst_access_mask(after.access)
        .old_layout(before.layout)
        .new_layout(after.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build()
}

fn buffer_image_copy(region: &BufferTextureCopyRegion, aspect: vk::ImageAspectFlags) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        buffer_row_length: region.row_length,
        buffer_image_height: region.image_height,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: region.mip_level,
            base_array_layer: region.array_layer,
            layer_count: 1,
        },
        image_offset: offset_3d(region.offset),
        image_extent: extent_3d(region.extent),
    }
}

impl CommandEncoder for VulkanEncoder<'_> {
    fn begin_render_pass(&mut self, colors: &[ColorAttachment], depth: Option<&DepthAttachment>, area: Scissor) {
        if self.in_render_pass {
            error!("Render pass begun inside another render pass, command skipped");
            return;
        }

        let mut color_infos = Vec::with_capacity(colors.len());
        for color in colors {
            let Some(target) = self.texture(color.texture, CommandKind::BeginRenderPass) else {
                return;
            };
            self.prepare(&target, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            color_infos.push(
                vk::RenderingAttachmentInfo::builder()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(convert::load_op(color.load_op()))
                    .store_op(convert::store_op(color.store_op()))
                    .clear_value(vk::ClearValue { color: vk::ClearColorValue { float32: color.clear_color } })
                    .build(),
            );
        }

        let mut depth_info = None;
        let mut stencil_info = None;
        if let Some(depth) = depth {
            let Some(target) = self.texture(depth.texture, CommandKind::BeginRenderPass) else {
                return;
            };
            let info = vk::RenderingAttachmentInfo::builder()
                .image_view(target.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(convert::load_op(depth.load_op))
                .store_op(convert::store_op(depth.store_op))
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: depth.clear_depth, stencil: depth.clear_stencil },
                })
                .build();
            depth_info = Some(info);
            if target.aspect.contains(vk::ImageAspectFlags::STENCIL) {
                stencil_info = Some(info);
            }
        }

        let mut rendering = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: area.x, y: area.y },
                extent: vk::Extent2D { width: area.width, height: area.height },
            })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(info) = depth_info.as_ref() {
            rendering = rendering.depth_attachment(info);
        }
        if let Some(info) = stencil_info.as_ref() {
            rendering = rendering.stencil_attachment(info);
        }

        unsafe { self.device().cmd_begin_rendering(self.cmd, &rendering) };
        self.in_render_pass = true;
    }

    fn end_render_pass(&mut self) {
        if !self.in_render_pass {
            error!("end_render_pass without an active render pass");
            return;
        }
        unsafe { self.device().cmd_end_rendering(self.cmd) };
        self.in_render_pass = false;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device().cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: &Scissor) {
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: scissor.x, y: scissor.y },
            extent: vk::Extent2D { width: scissor.width, height: scissor.height },
        };
        unsafe { self.device().cmd_set_scissor(self.cmd, 0, &[rect]) };
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        match self.ctx.pipeline(pipeline) {
            Some((native, _)) => unsafe { self.device().cmd_bind_pipeline(self.cmd, native.bind_point, native.raw) },
            None => error!(?pipeline, "Invalid pipeline handle, command skipped"),
        }
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, bindings: &[VertexBufferBinding]) {
        let mut buffers = Vec::with_capacity(bindings.len());
        let mut offsets = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let Some(buffer) = self.buffer(binding.buffer, CommandKind::BindVertexBuffers) else {
                return;
            };
            buffers.push(buffer.raw);
            offsets.push(binding.offset);
        }
        unsafe { self.device().cmd_bind_vertex_buffers(self.cmd, first_binding, &buffers, &offsets) };
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        if let Some(buffer) = self.buffer(buffer, CommandKind::BindIndexBuffer) {
            unsafe {
                self.device()
                    .cmd_bind_index_buffer(self.cmd, buffer.raw, offset, convert::index_type(index_type))
            };
        }
    }

    fn draw(&mut self, args: &DrawArgs) {
        unsafe {
            self.device().cmd_draw(
                self.cmd,
                args.vertex_count,
                args.instance_count,
                args.first_vertex,
                args.first_instance,
            )
        };
    }

    fn draw_indexed(&mut self, args: &DrawIndexedArgs) {
        unsafe {
            self.device().cmd_draw_indexed(
                self.cmd,
                args.index_count,
                args.instance_count,
                args.first_index,
                args.vertex_offset,
                args.first_instance,
            )
        };
    }

    fn draw_indirect(&mut self, args: &IndirectArgs) {
        if let Some(buffer) = self.buffer(args.buffer, CommandKind::DrawIndirect) {
            unsafe {
                self.device()
                    .cmd_draw_indirect(self.cmd, buffer.raw, args.offset, args.draw_count, args.stride)
            };
        }
    }

    fn draw_indexed_indirect(&mut self, args: &IndirectArgs) {
        if let Some(buffer) = self.buffer(args.buffer, CommandKind::DrawIndexedIndirect) {
            unsafe {
                self.device()
                    .cmd_draw_indexed_indirect(self.cmd, buffer.raw, args.offset, args.draw_count, args.stride)
            };
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device().cmd_dispatch(self.cmd, x, y, z) };
    }

    fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        if let Some(buffer) = self.buffer(buffer, CommandKind::DispatchIndirect) {
            unsafe { self.device().cmd_dispatch_indirect(self.cmd, buffer.raw, offset) };
        }
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]) {
        let (Some(src), Some(dst)) = (self.buffer(src, CommandKind::CopyBuffer), self.buffer(dst, CommandKind::CopyBuffer))
        else {
            return;
        };
        let regions: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy { src_offset: r.src_offset, dst_offset: r.dst_offset, size: r.size })
            .collect();
        unsafe { self.device().cmd_copy_buffer(self.cmd, src.raw, dst.raw, &regions) };
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, regions: &[TextureCopyRegion]) {
        let (Some(src), Some(dst)) =
            (self.texture(src, CommandKind::CopyTexture), self.texture(dst, CommandKind::CopyTexture))
        else {
            return;
        };
        self.prepare(&src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        self.prepare(&dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let regions: Vec<vk::ImageCopy> = regions
            .iter()
            .map(|r| vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: src.aspect,
                    mip_level: r.src_mip,
                    base_array_layer: r.src_layer,
                    layer_count: 1,
                },
                src_offset: offset_3d(r.src_offset),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: dst.aspect,
                    mip_level: r.dst_mip,
                    base_array_layer: r.dst_layer,
                    layer_count: 1,
                },
                dst_offset: offset_3d(r.dst_offset),
                extent: extent_3d(r.extent),
            })
            .collect();
        unsafe {
            self.device().cmd_copy_image(
                self.cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            )
        };
    }

    fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, regions: &[BufferTextureCopyRegion]) {
        let (Some(src), Some(dst)) = (
            self.buffer(src, CommandKind::CopyBufferToTexture),
            self.texture(dst, CommandKind::CopyBufferToTexture),
        ) else {
            return;
        };
        self.prepare(&dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let regions: Vec<vk::BufferImageCopy> = regions.iter().map(|r| buffer_image_copy(r, dst.aspect)).collect();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.cmd,
                src.raw,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            )
        };
    }

    fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, regions: &[BufferTextureCopyRegion]) {
        let (Some(src), Some(dst)) = (
            self.texture(src, CommandKind::CopyTextureToBuffer),
            self.buffer(dst, CommandKind::CopyTextureToBuffer),
        ) else {
            return;
        };
        self.prepare(&src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let regions: Vec<vk::BufferImageCopy> = regions.iter().map(|r| buffer_image_copy(r, src.aspect)).collect();
        unsafe {
            self.device().cmd_copy_image_to_buffer(
                self.cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw,
                &regions,
            )
        };
    }

    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(dst) = self.buffer(dst, CommandKind::UpdateBuffer) else {
            return;
        };
        let Some(staging) = self.staging(data, CommandKind::UpdateBuffer) else {
            return;
        };
        let region = vk::BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 };
        unsafe { self.device().cmd_copy_buffer(self.cmd, staging, dst.raw, &[region]) };
    }

    fn upload_texture(&mut self, dst: TextureHandle, region: &BufferTextureCopyRegion, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(target) = self.texture(dst, CommandKind::UploadTexture) else {
            return;
        };
        let Some(staging) = self.staging(data, CommandKind::UploadTexture) else {
            return;
        };
        self.prepare(&target, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let copy = buffer_image_copy(&BufferTextureCopyRegion { buffer_offset: 0, ..*region }, target.aspect);
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.cmd,
                staging,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            )
        };
    }

    fn bind_descriptor_set(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        let (Some(native_layout), Some(native_set)) = (self.ctx.pipeline_layout(layout), self.ctx.descriptor_set(set))
        else {
            error!(?layout, ?set, "Invalid descriptor set binding, command skipped");
            return;
        };
        let bind_point = match bind_point {
            PipelineBindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineBindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
        };
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                native_layout.raw,
                set_index,
                &[native_set.raw],
                &[],
            )
        };
    }

    fn push_constants(&mut self, layout: PipelineLayoutHandle, stages: ShaderStages, offset: u32, data: &[u8]) {
        match self.ctx.pipeline_layout(layout) {
            Some(native) => unsafe {
                self.device()
                    .cmd_push_constants(self.cmd, native.raw, convert::shader_stages(stages), offset, data)
            },
            None => error!(?layout, "Invalid pipeline layout handle, command skipped"),
        }
    }

    fn resource_barrier(&mut self, textures: &[TextureBarrier], buffers: &[BufferBarrier]) {
        let mut image_barriers = Vec::with_capacity(textures.len());
        for barrier in textures {
            let Some(target) = self.texture(barrier.texture, CommandKind::ResourceBarrier) else {
                continue;
            };
            if target.swapchain.is_some() {
                self.prepare(&target, convert::state_info(barrier.after()).layout);
                continue;
            }
            let range = vk::ImageSubresourceRange {
                aspect_mask: target.aspect,
                base_mip_level: barrier.base_mip as u32,
                level_count: count_or_remaining(barrier.mip_count, vk::REMAINING_MIP_LEVELS),
                base_array_layer: barrier.base_layer as u32,
                layer_count: count_or_remaining(barrier.layer_count, vk::REMAINING_ARRAY_LAYERS),
            };
            image_barriers.push(image_barrier(
                target.image,
                range,
                convert::state_info(barrier.before()),
                convert::state_info(barrier.after()),
            ));
        }

        let mut buffer_barriers = Vec::with_capacity(buffers.len());
        for barrier in buffers {
            let Some(buffer) = self.buffer(barrier.buffer, CommandKind::ResourceBarrier) else {
                continue;
            };
            let before = convert::state_info(barrier.before());
            let after = convert::state_info(barrier.after());
            buffer_barriers.push(
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(before.stage)
                    .src_access_mask(before.access)
                    .dst_stage_mask(after.stage)
                    .dst_access_mask(after.access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.raw)
                    .offset(barrier.offset)
                    .size(if barrier.size == u64::MAX { vk::WHOLE_SIZE } else { barrier.size })
                    .build(),
            );
        }

        if image_barriers.is_empty() && buffer_barriers.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::builder()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe { self.device().cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    fn execute_secondary(&mut self, stream: CommandStreamHandle) {
        if self.ctx.level() == CommandListLevel::Secondary {
            error!(?stream, "Secondary command lists cannot execute other secondaries");
            return;
        }
        if self.in_render_pass {
            error!(?stream, "Secondary command lists can only be executed outside a render pass");
            return;
        }
        match self.ctx.secondary(stream) {
            Some(secondary) => unsafe { self.device().cmd_execute_commands(self.cmd, &[secondary.buffer]) },
            None => debug!(?stream, "Secondary command stream has nothing to execute this frame, command skipped"),
        }
    }

    fn begin_debug_label(&mut self, name: &str, color: [f32; 4]) {
        let Some(debug_utils) = &self.backend.ctx.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
        unsafe { debug_utils.cmd_begin_debug_utils_label(self.cmd, &label) };
    }

    fn end_debug_label(&mut self) {
        if let Some(debug_utils) = &self.backend.ctx.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(self.cmd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_counts() {
        assert_eq!(count_or_remaining(u16::MAX, vk::REMAINING_MIP_LEVELS), vk::REMAINING_MIP_LEVELS);
        assert_eq!(count_or_remaining(3, vk::REMAINING_MIP_LEVELS), 3);
    }

    #[test]
    fn test_layout_transition_barrier() {
        let barrier = image_barrier(
            vk::Image::null(),
            COLOR_RANGE,
            convert::layout_info(vk::ImageLayout::UNDEFINED),
            convert::layout_info(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn test_upload_copy_depth_defaults_to_one() {
        let copy = buffer_image_copy(&BufferTextureCopyRegion::full_2d(16, 8), vk::ImageAspectFlags::COLOR);
        assert_eq!(copy.image_extent, vk::Extent3D { width: 16, height: 8, depth: 1 });
    }
}
