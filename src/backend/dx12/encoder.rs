//! DirectX 12 命令编码
//!
//! 交换链图像在每个命令列表开始时处于 `PRESENT` 状态，第一次被写入时自动转换，
//! 一级列表结束时转换回 `PRESENT`。普通纹理完全按调用方的屏障。
//!
//! 二级命令列表是 bundle：渲染通道、视口、屏障与拷贝类命令会被拒绝。

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use tracing::{debug, error, warn};
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::pipeline::IndirectKind;
use super::{align_up, convert, Dx12Backend, Dx12Buffer};
use crate::backend::{Backend, CommandListLevel, EncodeContext, TextureRef};
use crate::command::*;
use crate::core::error::Result;
use crate::handle::{
    BufferHandle, CommandStreamHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle, TextureHandle,
};
use crate::resource::{BufferDesc, Format, MemoryLocation};
use crate::shader::ShaderStages;

/// 纹理拷贝的行距对齐
const ROW_PITCH_ALIGNMENT: u64 = D3D12_TEXTURE_DATA_PITCH_ALIGNMENT as u64;
/// 纹理拷贝在缓冲区中的起始偏移对齐
const PLACEMENT_ALIGNMENT: u64 = D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT as u64;

/// 解析后的纹理
#[derive(Clone, Copy)]
struct Target<'a> {
    resource: &'a ID3D12Resource,
    format: Format,
    mip_levels: u32,
    rtv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    dsv: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    is_swapchain: bool,
}

pub struct Dx12Encoder<'a> {
    backend: &'a Dx12Backend,
    list: &'a ID3D12GraphicsCommandList,
    ty: D3D12_COMMAND_LIST_TYPE,
    ctx: EncodeContext<'a, Dx12Backend>,
    intermediates: Vec<Dx12Buffer>,
    /// 本命令列表中交换链图像的当前状态
    swapchain_states: Vec<(&'a ID3D12Resource, D3D12_RESOURCE_STATES)>,
    in_render_pass: bool,
    /// 最近绑定的管线声明的顶点缓冲步长
    vertex_strides: Vec<(u32, u32)>,
}

/// 子资源下标
fn subresource(mip: u32, layer: u32, mip_levels: u32) -> u32 {
    mip + layer * mip_levels
}

fn transition(
    resource: &ID3D12Resource,
    subresource: u32,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // 借用资源指针；屏障只在本次调用期间使用
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: subresource,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn uav_barrier(resource: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
            }),
        },
    }
}

fn subresource_location(resource: &ID3D12Resource, index: u32) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: index },
    }
}

fn footprint_location(
    buffer: &ID3D12Resource,
    offset: u64,
    format: DXGI_FORMAT,
    extent: [u32; 3],
    row_pitch: u32,
) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(buffer) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: format,
                    Width: extent[0],
                    Height: extent[1],
                    Depth: extent[2].max(1),
                    RowPitch: row_pitch,
                },
            },
        },
    }
}

fn copy_box(offset: [i32; 3], extent: [u32; 3]) -> D3D12_BOX {
    let left = offset[0].max(0) as u32;
    let top = offset[1].max(0) as u32;
    let front = offset[2].max(0) as u32;
    D3D12_BOX {
        left,
        top,
        front,
        right: left + extent[0],
        bottom: top + extent[1],
        back: front + extent[2].max(1),
    }
}

/// 缓冲区中一行的字节数；`row_length == 0` 表示紧密排列
fn buffer_row_pitch(region: &BufferTextureCopyRegion, format: Format) -> u64 {
    let texels = if region.row_length == 0 { region.extent[0] } else { region.row_length };
    u64::from(texels) * u64::from(format.bytes_per_pixel())
}

/// 把紧密排列的行复制为按 `dst_pitch` 对齐的行
///
/// # 参数
///
/// * `data` - 源数据
/// * `src_pitch` - 源数据的行距
/// * `row_bytes` - 每行有效字节数
/// * `rows` - 行数（高度 × 深度）
/// * `dst_pitch` - 目标行距
///
/// # 返回值
///
/// 源数据不足时返回 `None`
fn pack_rows(data: &[u8], src_pitch: usize, row_bytes: usize, rows: usize, dst_pitch: usize) -> Option<Vec<u8>> {
    if rows == 0 {
        return Some(Vec::new());
    }
    let needed = src_pitch * (rows - 1) + row_bytes;
    if data.len() < needed {
        return None;
    }
    let mut packed = vec![0u8; dst_pitch * rows];
    for row in 0..rows {
        let src = &data[row * src_pitch..row * src_pitch + row_bytes];
        packed[row * dst_pitch..row * dst_pitch + row_bytes].copy_from_slice(src);
    }
    Some(packed)
}

fn index_format(index_type: IndexType) -> DXGI_FORMAT {
    match index_type {
        IndexType::U16 => DXGI_FORMAT_R16_UINT,
        IndexType::U32 => DXGI_FORMAT_R32_UINT,
    }
}

impl<'a> Dx12Encoder<'a> {
    pub(super) fn new(
        backend: &'a Dx12Backend,
        list: &'a ID3D12GraphicsCommandList,
        ty: D3D12_COMMAND_LIST_TYPE,
        ctx: EncodeContext<'a, Dx12Backend>,
    ) -> Self {
        Self {
            backend,
            list,
            ty,
            ctx,
            intermediates: Vec::new(),
            swapchain_states: Vec::new(),
            in_render_pass: false,
            vertex_strides: Vec::new(),
        }
    }

    /// 把交换链图像转换回呈现状态并关闭列表
    pub(super) fn finish(mut self) -> Result<Vec<Dx12Buffer>> {
        if self.in_render_pass {
            warn!("Command list closed inside a render pass");
            self.in_render_pass = false;
        }

        if self.ctx.level() == CommandListLevel::Primary {
            let barriers: Vec<D3D12_RESOURCE_BARRIER> = self
                .swapchain_states
                .iter()
                .filter(|(_, state)| *state != D3D12_RESOURCE_STATE_PRESENT)
                .map(|(resource, state)| {
                    transition(resource, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, *state, D3D12_RESOURCE_STATE_PRESENT)
                })
                .collect();
            if !barriers.is_empty() {
                unsafe { self.list.ResourceBarrier(&barriers) };
            }
        }

        match unsafe { self.list.Close() } {
            Ok(()) => Ok(self.intermediates),
            Err(e) => {
                for buffer in self.intermediates.drain(..) {
                    self.backend.destroy_buffer(buffer);
                }
                Err(super::dx_error("ID3D12GraphicsCommandList::Close")(e))
            }
        }
    }

    fn is_bundle(&self) -> bool {
        self.ty == D3D12_COMMAND_LIST_TYPE_BUNDLE
    }

    /// bundle 不能录制的命令记录错误并返回 `true`
    fn rejected_in_bundle(&self, command: CommandKind) -> bool {
        if self.is_bundle() {
            error!(command = command.name(), "Command is not allowed in a DX12 bundle, command skipped");
            return true;
        }
        false
    }

    fn buffer(&self, handle: BufferHandle, command: CommandKind) -> Option<&'a Dx12Buffer> {
        let buffer = self.ctx.buffer(handle);
        if buffer.is_none() {
            error!(?handle, command = command.name(), "Invalid buffer handle, command skipped");
        }
        buffer
    }

    fn texture(&self, handle: TextureHandle, command: CommandKind) -> Option<Target<'a>> {
        let backend = self.backend;
        let target = match self.ctx.texture(handle) {
            Some(TextureRef::Native(texture)) => Some(Target {
                resource: &texture.raw,
                format: texture.format,
                mip_levels: texture.mip_levels,
                rtv: texture.rtv.map(|i| backend.rtv_heap.cpu_handle(i)),
                dsv: texture.dsv.map(|i| backend.dsv_heap.cpu_handle(i)),
                is_swapchain: false,
            }),
            Some(TextureRef::Swapchain { swapchain, image }) => {
                let index = image as usize;
                let format = self.ctx.texture_info(handle).map_or(Format::Bgra8Unorm, |info| info.format);
                match (swapchain.images.get(index), swapchain.rtvs.get(index)) {
                    (Some(resource), Some(&rtv)) => Some(Target {
                        resource,
                        format,
                        mip_levels: 1,
                        rtv: Some(backend.rtv_heap.cpu_handle(rtv)),
                        dsv: None,
                        is_swapchain: true,
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

    /// 交换链目标在使用前转换状态，普通纹理按调用方的屏障
    fn prepare(&mut self, target: &Target<'a>, state: D3D12_RESOURCE_STATES) {
        if !target.is_swapchain || self.is_bundle() {
            return;
        }
        let current = match self.swapchain_states.iter_mut().find(|(r, _)| *r == target.resource) {
            Some(entry) => entry,
            None => {
                self.swapchain_states.push((target.resource, D3D12_RESOURCE_STATE_PRESENT));
                let last = self.swapchain_states.len() - 1;
                &mut self.swapchain_states[last]
            }
        };
        if current.1 == state {
            return;
        }
        let barrier = transition(target.resource, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, current.1, state);
        current.1 = state;
        unsafe { self.list.ResourceBarrier(&[barrier]) };
    }

    fn staging(&mut self, data: &[u8], command: CommandKind) -> Option<ID3D12Resource> {
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

    fn execute_indirect(&mut self, kind: IndirectKind, buffer: &ID3D12Resource, offset: u64, count: u32, stride: u32) {
        let signature = match self.backend.command_signature(kind, stride) {
            Ok(signature) => signature,
            Err(e) => {
                error!(?kind, "Failed to create command signature: {}", e);
                return;
            }
        };
        unsafe {
            self.list
                .ExecuteIndirect(&signature, count, buffer, offset, None::<&ID3D12Resource>, 0)
        };
    }

    fn copy_with_footprint(
        &mut self,
        buffer: &Dx12Buffer,
        target: &Target<'a>,
        regions: &[BufferTextureCopyRegion],
        to_texture: bool,
        command: CommandKind,
    ) {
        let format = unsafe { target.resource.GetDesc() }.Format;
        for region in regions {
            let pitch = buffer_row_pitch(region, target.format);
            if pitch % ROW_PITCH_ALIGNMENT != 0 || region.buffer_offset % PLACEMENT_ALIGNMENT != 0 {
                error!(
                    command = command.name(),
                    row_pitch = pitch,
                    buffer_offset = region.buffer_offset,
                    "DX12 requires 256-byte row pitch and 512-byte buffer offset, region skipped"
                );
                continue;
            }
            let texels = if region.row_length == 0 { region.extent[0] } else { region.row_length };
            let footprint = footprint_location(
                &buffer.raw,
                region.buffer_offset,
                format,
                [texels, region.extent[1], region.extent[2]],
                pitch as u32,
            );
            let texture = subresource_location(
                target.resource,
                subresource(region.mip_level, region.array_layer, target.mip_levels),
            );
            unsafe {
                if to_texture {
                    let source_box = copy_box([0; 3], region.extent);
                    self.list.CopyTextureRegion(
                        &texture,
                        region.offset[0].max(0) as u32,
                        region.offset[1].max(0) as u32,
                        region.offset[2].max(0) as u32,
                        &footprint,
                        Some(&source_box),
                    );
                } else {
                    let source_box = copy_box(region.offset, region.extent);
                    self.list.CopyTextureRegion(&footprint, 0, 0, 0, &texture, Some(&source_box));
                }
            }
        }
    }
}

impl CommandEncoder for Dx12Encoder<'_> {
    fn begin_render_pass(&mut self, colors: &[ColorAttachment], depth: Option<&DepthAttachment>, area: Scissor) {
        if self.rejected_in_bundle(CommandKind::BeginRenderPass) {
            return;
        }
        if self.in_render_pass {
            error!("Render pass begun inside another render pass, command skipped");
            return;
        }

        let mut rtvs = Vec::with_capacity(colors.len());
        for color in colors {
            let Some(target) = self.texture(color.texture, CommandKind::BeginRenderPass) else {
                return;
            };
            let Some(rtv) = target.rtv else {
                error!(texture = ?color.texture, "Texture has no render target view, command skipped");
                return;
            };
            self.prepare(&target, D3D12_RESOURCE_STATE_RENDER_TARGET);
            rtvs.push((rtv, color.load_op(), color.clear_color));
        }

        let mut dsv = None;
        if let Some(depth) = depth {
            let Some(target) = self.texture(depth.texture, CommandKind::BeginRenderPass) else {
                return;
            };
            let Some(handle) = target.dsv else {
                error!(texture = ?depth.texture, "Texture has no depth stencil view, command skipped");
                return;
            };
            dsv = Some((handle, target.format.has_stencil()));
        }

        let handles: Vec<D3D12_CPU_DESCRIPTOR_HANDLE> = rtvs.iter().map(|(h, _, _)| *h).collect();
        let depth_handle = dsv.map(|(h, _)| h);
        let viewport = D3D12_VIEWPORT {
            TopLeftX: area.x as f32,
            TopLeftY: area.y as f32,
            Width: area.width as f32,
            Height: area.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        let rect = RECT {
            left: area.x,
            top: area.y,
            right: area.x + area.width as i32,
            bottom: area.y + area.height as i32,
        };

        unsafe {
            self.list.OMSetRenderTargets(
                handles.len() as u32,
                (!handles.is_empty()).then(|| handles.as_ptr()),
                false,
                depth_handle.as_ref().map(|h| h as *const _),
            );
            for (handle, load_op, clear_color) in &rtvs {
                if *load_op == LoadOp::Clear {
                    self.list.ClearRenderTargetView(*handle, clear_color, Some(&[rect]));
                }
            }
            if let (Some(depth), Some((handle, stencil))) = (depth, dsv) {
                if depth.load_op == LoadOp::Clear {
                    let mut flags = D3D12_CLEAR_FLAG_DEPTH;
                    if stencil {
                        flags |= D3D12_CLEAR_FLAG_STENCIL;
                    }
                    self.list.ClearDepthStencilView(
                        handle,
                        flags,
                        depth.clear_depth,
                        depth.clear_stencil as u8,
                        Some(&[rect]),
                    );
                }
            }
            self.list.RSSetViewports(&[viewport]);
            self.list.RSSetScissorRects(&[rect]);
        }
        self.in_render_pass = true;
    }

    fn end_render_pass(&mut self) {
        if self.rejected_in_bundle(CommandKind::EndRenderPass) {
            return;
        }
        if !self.in_render_pass {
            error!("end_render_pass without an active render pass");
            return;
        }
        self.in_render_pass = false;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        if self.rejected_in_bundle(CommandKind::SetViewport) {
            return;
        }
        let viewport = D3D12_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };
        unsafe { self.list.RSSetViewports(&[viewport]) };
    }

    fn set_scissor(&mut self, scissor: &Scissor) {
        if self.rejected_in_bundle(CommandKind::SetScissor) {
            return;
        }
        let rect = RECT {
            left: scissor.x,
            top: scissor.y,
            right: scissor.x + scissor.width as i32,
            bottom: scissor.y + scissor.height as i32,
        };
        unsafe { self.list.RSSetScissorRects(&[rect]) };
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        let Some((native, bind_point)) = self.ctx.pipeline(pipeline) else {
            error!(?pipeline, "Invalid pipeline handle, command skipped");
            return;
        };
        unsafe {
            match bind_point {
                PipelineBindPoint::Graphics => {
                    self.list.SetGraphicsRootSignature(&native.root_signature);
                    self.list.IASetPrimitiveTopology(native.topology);
                }
                PipelineBindPoint::Compute => self.list.SetComputeRootSignature(&native.root_signature),
            }
            self.list.SetPipelineState(&native.raw);
        }
        self.vertex_strides = native.vertex_strides.clone();
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, bindings: &[VertexBufferBinding]) {
        let mut views = Vec::with_capacity(bindings.len());
        for (i, binding) in bindings.iter().enumerate() {
            let Some(buffer) = self.buffer(binding.buffer, CommandKind::BindVertexBuffers) else {
                return;
            };
            let slot = first_binding + i as u32;
            let stride = self
                .vertex_strides
                .iter()
                .find(|(b, _)| *b == slot)
                .map_or(0, |(_, stride)| *stride);
            views.push(D3D12_VERTEX_BUFFER_VIEW {
                BufferLocation: buffer.gpu_address + binding.offset,
                SizeInBytes: buffer.size.saturating_sub(binding.offset) as u32,
                StrideInBytes: stride,
            });
        }
        unsafe { self.list.IASetVertexBuffers(first_binding, Some(&views)) };
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        if let Some(buffer) = self.buffer(buffer, CommandKind::BindIndexBuffer) {
            let view = D3D12_INDEX_BUFFER_VIEW {
                BufferLocation: buffer.gpu_address + offset,
                SizeInBytes: buffer.size.saturating_sub(offset) as u32,
                Format: index_format(index_type),
            };
            unsafe { self.list.IASetIndexBuffer(Some(&view)) };
        }
    }

    fn draw(&mut self, args: &DrawArgs) {
        unsafe {
            self.list
                .DrawInstanced(args.vertex_count, args.instance_count, args.first_vertex, args.first_instance)
        };
    }

    fn draw_indexed(&mut self, args: &DrawIndexedArgs) {
        unsafe {
            self.list.DrawIndexedInstanced(
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
            self.execute_indirect(IndirectKind::Draw, &buffer.raw, args.offset, args.draw_count, args.stride);
        }
    }

    fn draw_indexed_indirect(&mut self, args: &IndirectArgs) {
        if let Some(buffer) = self.buffer(args.buffer, CommandKind::DrawIndexedIndirect) {
            self.execute_indirect(IndirectKind::DrawIndexed, &buffer.raw, args.offset, args.draw_count, args.stride);
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.list.Dispatch(x, y, z) };
    }

    fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        if let Some(buffer) = self.buffer(buffer, CommandKind::DispatchIndirect) {
            self.execute_indirect(IndirectKind::Dispatch, &buffer.raw, offset, 1, 0);
        }
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopyRegion]) {
        if self.rejected_in_bundle(CommandKind::CopyBuffer) {
            return;
        }
        let (Some(src), Some(dst)) = (self.buffer(src, CommandKind::CopyBuffer), self.buffer(dst, CommandKind::CopyBuffer))
        else {
            return;
        };
        for region in regions {
            unsafe {
                self.list
                    .CopyBufferRegion(&dst.raw, region.dst_offset, &src.raw, region.src_offset, region.size)
            };
        }
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle, regions: &[TextureCopyRegion]) {
        if self.rejected_in_bundle(CommandKind::CopyTexture) {
            return;
        }
        let (Some(src), Some(dst)) =
            (self.texture(src, CommandKind::CopyTexture), self.texture(dst, CommandKind::CopyTexture))
        else {
            return;
        };
        self.prepare(&src, D3D12_RESOURCE_STATE_COPY_SOURCE);
        self.prepare(&dst, D3D12_RESOURCE_STATE_COPY_DEST);

        for region in regions {
            let src_location = subresource_location(src.resource, subresource(region.src_mip, region.src_layer, src.mip_levels));
            let dst_location = subresource_location(dst.resource, subresource(region.dst_mip, region.dst_layer, dst.mip_levels));
            let source_box = copy_box(region.src_offset, region.extent);
            unsafe {
                self.list.CopyTextureRegion(
                    &dst_location,
                    region.dst_offset[0].max(0) as u32,
                    region.dst_offset[1].max(0) as u32,
                    region.dst_offset[2].max(0) as u32,
                    &src_location,
                    Some(&source_box),
                )
            };
        }
    }

    fn copy_buffer_to_texture(&mut self, src: BufferHandle, dst: TextureHandle, regions: &[BufferTextureCopyRegion]) {
        if self.rejected_in_bundle(CommandKind::CopyBufferToTexture) {
            return;
        }
        let (Some(src), Some(dst)) = (
            self.buffer(src, CommandKind::CopyBufferToTexture),
            self.texture(dst, CommandKind::CopyBufferToTexture),
        ) else {
            return;
        };
        self.prepare(&dst, D3D12_RESOURCE_STATE_COPY_DEST);
        self.copy_with_footprint(src, &dst, regions, true, CommandKind::CopyBufferToTexture);
    }

    fn copy_texture_to_buffer(&mut self, src: TextureHandle, dst: BufferHandle, regions: &[BufferTextureCopyRegion]) {
        if self.rejected_in_bundle(CommandKind::CopyTextureToBuffer) {
            return;
        }
        let (Some(src), Some(dst)) = (
            self.texture(src, CommandKind::CopyTextureToBuffer),
            self.buffer(dst, CommandKind::CopyTextureToBuffer),
        ) else {
            return;
        };
        self.prepare(&src, D3D12_RESOURCE_STATE_COPY_SOURCE);
        self.copy_with_footprint(dst, &src, regions, false, CommandKind::CopyTextureToBuffer);
    }

    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        if data.is_empty() || self.rejected_in_bundle(CommandKind::UpdateBuffer) {
            return;
        }
        let Some(dst) = self.buffer(dst, CommandKind::UpdateBuffer) else {
            return;
        };
        let Some(staging) = self.staging(data, CommandKind::UpdateBuffer) else {
            return;
        };
        unsafe { self.list.CopyBufferRegion(&dst.raw, offset, &staging, 0, data.len() as u64) };
    }

    fn upload_texture(&mut self, dst: TextureHandle, region: &BufferTextureCopyRegion, data: &[u8]) {
        if data.is_empty() || self.rejected_in_bundle(CommandKind::UploadTexture) {
            return;
        }
        let Some(target) = self.texture(dst, CommandKind::UploadTexture) else {
            return;
        };

        // 紧密排列的数据按 256 字节行距重新排列
        let src_pitch = buffer_row_pitch(region, target.format) as usize;
        let row_bytes = region.extent[0] as usize * target.format.bytes_per_pixel() as usize;
        let rows = region.extent[1] as usize * region.extent[2].max(1) as usize;
        let dst_pitch = align_up(row_bytes as u64, ROW_PITCH_ALIGNMENT) as usize;
        let Some(packed) = pack_rows(data, src_pitch, row_bytes, rows, dst_pitch) else {
            error!(
                texture = ?dst,
                len = data.len(),
                "Upload data is smaller than the region it describes, command skipped"
            );
            return;
        };
        let Some(staging) = self.staging(&packed, CommandKind::UploadTexture) else {
            return;
        };
        self.prepare(&target, D3D12_RESOURCE_STATE_COPY_DEST);

        let format = unsafe { target.resource.GetDesc() }.Format;
        let footprint = footprint_location(&staging, 0, format, region.extent, dst_pitch as u32);
        let texture = subresource_location(
            target.resource,
            subresource(region.mip_level, region.array_layer, target.mip_levels),
        );
        let source_box = copy_box([0; 3], region.extent);
        unsafe {
            self.list.CopyTextureRegion(
                &texture,
                region.offset[0].max(0) as u32,
                region.offset[1].max(0) as u32,
                region.offset[2].max(0) as u32,
                &footprint,
                Some(&source_box),
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
        let Some(plan) = native_layout.sets.get(set_index as usize) else {
            error!(?layout, set_index, "Pipeline layout has no such descriptor set, command skipped");
            return;
        };

        let mut tables = Vec::with_capacity(2);
        if let (Some(param), Some(start)) = (plan.resource_param, native_set.resource_start) {
            tables.push((param, self.backend.shader_view_heap.gpu_handle(start)));
        }
        if let (Some(param), Some(start)) = (plan.sampler_param, native_set.sampler_start) {
            tables.push((param, self.backend.shader_sampler_heap.gpu_handle(start)));
        }
        for (param, handle) in tables {
            unsafe {
                match bind_point {
                    PipelineBindPoint::Graphics => self.list.SetGraphicsRootDescriptorTable(param, handle),
                    PipelineBindPoint::Compute => self.list.SetComputeRootDescriptorTable(param, handle),
                }
            }
        }
    }

    fn push_constants(&mut self, layout: PipelineLayoutHandle, stages: ShaderStages, offset: u32, data: &[u8]) {
        let Some(native) = self.ctx.pipeline_layout(layout) else {
            error!(?layout, "Invalid pipeline layout handle, command skipped");
            return;
        };
        let Some((param, _)) = native.push_constants else {
            error!(?layout, "Pipeline layout declares no push constants, command skipped");
            return;
        };
        let words: Vec<u32> = data
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();
        let ptr = words.as_ptr() as *const c_void;
        unsafe {
            if stages.contains(ShaderStages::COMPUTE) {
                self.list
                    .SetComputeRoot32BitConstants(param, words.len() as u32, ptr, offset / 4);
            } else {
                self.list
                    .SetGraphicsRoot32BitConstants(param, words.len() as u32, ptr, offset / 4);
            }
        }
    }

    fn resource_barrier(&mut self, textures: &[TextureBarrier], buffers: &[BufferBarrier]) {
        if self.rejected_in_bundle(CommandKind::ResourceBarrier) {
            return;
        }
        let mut barriers = Vec::new();

        for barrier in textures {
            let Some(target) = self.texture(barrier.texture, CommandKind::ResourceBarrier) else {
                continue;
            };
            if target.is_swapchain {
                self.prepare(&target, convert::state(barrier.after()));
                continue;
            }
            let before = convert::state(barrier.before());
            let after = convert::state(barrier.after());
            if before == after {
                if after == D3D12_RESOURCE_STATE_UNORDERED_ACCESS {
                    barriers.push(uav_barrier(target.resource));
                }
                continue;
            }

            let whole = barrier.base_mip == 0
                && barrier.base_layer == 0
                && barrier.mip_count == u16::MAX
                && barrier.layer_count == u16::MAX;
            if whole {
                barriers.push(transition(target.resource, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, before, after));
                continue;
            }
            let layers = unsafe { target.resource.GetDesc() }.DepthOrArraySize as u32;
            let mip_end = match barrier.mip_count {
                u16::MAX => target.mip_levels,
                n => (barrier.base_mip as u32 + n as u32).min(target.mip_levels),
            };
            let layer_end = match barrier.layer_count {
                u16::MAX => layers,
                n => (barrier.base_layer as u32 + n as u32).min(layers),
            };
            for layer in barrier.base_layer as u32..layer_end {
                for mip in barrier.base_mip as u32..mip_end {
                    barriers.push(transition(
                        target.resource,
                        subresource(mip, layer, target.mip_levels),
                        before,
                        after,
                    ));
                }
            }
        }

        for barrier in buffers {
            let Some(buffer) = self.buffer(barrier.buffer, CommandKind::ResourceBarrier) else {
                continue;
            };
            // 上传 / 回读堆的资源状态固定
            if buffer.location != MemoryLocation::GpuOnly {
                continue;
            }
            let before = convert::state(barrier.before());
            let after = convert::state(barrier.after());
            if before == after {
                if after == D3D12_RESOURCE_STATE_UNORDERED_ACCESS {
                    barriers.push(uav_barrier(&buffer.raw));
                }
                continue;
            }
            barriers.push(transition(&buffer.raw, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, before, after));
        }

        if !barriers.is_empty() {
            unsafe { self.list.ResourceBarrier(&barriers) };
        }
    }

    fn execute_secondary(&mut self, stream: CommandStreamHandle) {
        if self.ctx.level() == CommandListLevel::Secondary {
            error!(?stream, "Secondary command lists cannot execute other secondaries");
            return;
        }
        if self.ty != D3D12_COMMAND_LIST_TYPE_DIRECT {
            error!(?stream, "Bundles can only be executed on direct command lists");
            return;
        }
        match self.ctx.secondary(stream) {
            Some(secondary) => unsafe { self.list.ExecuteBundle(&secondary.raw) },
            None => debug!(?stream, "Secondary command stream has nothing to execute this frame, command skipped"),
        }
    }

    fn begin_debug_label(&mut self, name: &str, _color: [f32; 4]) {
        // PIX 元数据 0：以 0 结尾的 UTF-16 字符串
        let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        unsafe {
            self.list
                .BeginEvent(0, Some(wide.as_ptr() as *const c_void), (wide.len() * 2) as u32)
        };
    }

    fn end_debug_label(&mut self) {
        unsafe { self.list.EndEvent() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_index() {
        assert_eq!(subresource(0, 0, 4), 0);
        assert_eq!(subresource(2, 1, 4), 6);
    }

    #[test]
    fn test_pack_rows_pads_to_pitch() {
        let data: Vec<u8> = (0..12).collect();
        let packed = pack_rows(&data, 4, 4, 3, 8).unwrap();
        assert_eq!(packed.len(), 24);
        assert_eq!(&packed[0..4], &[0, 1, 2, 3]);
        assert_eq!(&packed[8..12], &[4, 5, 6, 7]);
        assert_eq!(&packed[16..20], &[8, 9, 10, 11]);
        assert!(packed[4..8].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pack_rows_rejects_short_data() {
        assert!(pack_rows(&[0u8; 7], 4, 4, 2, 256).is_none());
        assert_eq!(pack_rows(&[], 4, 4, 0, 256), Some(Vec::new()));
    }

    #[test]
    fn test_row_pitch_uses_row_length() {
        let mut region = BufferTextureCopyRegion::full_2d(10, 4);
        assert_eq!(buffer_row_pitch(&region, Format::Rgba8Unorm), 40);
        region.row_length = 64;
        assert_eq!(buffer_row_pitch(&region, Format::Rgba8Unorm), 256);
    }

    #[test]
    fn test_copy_box_covers_extent() {
        let b = copy_box([2, 3, 0], [4, 5, 0]);
        assert_eq!((b.left, b.top, b.front), (2, 3, 0));
        assert_eq!((b.right, b.bottom, b.back), (6, 8, 1));
    }
}
