//! 模拟后端
//!
//! 不访问任何 GPU，用于无窗口环境和测试：
//!
//! - 时间线信号量按配置的完成模式推进：`immediate` 在提交时完成，
//!   `lazy` 只在 CPU 等待时推进到被等待的值
//! - 缓冲区数据保存在内存中，`update_buffer` / `copy_buffer` 在提交时生效
//! - 交换链按顺序轮转图像
//! - 所有“原生调用”记录到事件日志，测试可以据此断言实际发生了什么

mod encoder;

pub use encoder::NullEncoder;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use super::{
    AcquireResult, Backend, BufferWrite, CommandListLevel, EncodeContext, ImageWrite, PresentResult,
    SemaphoreKind, SubmitBatch, WaitStatus,
};
use crate::command::{BufferCopyRegion, CommandKind, PipelineBindPoint};
use crate::core::config::{Config, NullCompletion};
use crate::core::error::{GraphicsError, Result};
use crate::core::sync::lock;
use crate::queue::{NativeQueueSlot, QueueFamilyDesc, QueueLayout};
use crate::resource::{
    BufferDesc, DescriptorBinding, DescriptorSetLayoutDesc, PipelineLayoutDesc, SamplerDesc, TextureDesc,
};
use crate::shader::{CompiledShader, ComputePipelineDesc, GraphicsPipelineDesc, ShaderTarget};
use crate::swapchain::SwapchainDesc;

/// 模拟后端记录的一次“原生调用”
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullEvent {
    Create { kind: &'static str, id: u64 },
    Destroy { kind: &'static str, id: u64 },
    Submit {
        queue: NativeQueueSlot,
        /// 按顺序拼接的全部命令种类
        commands: Vec<CommandKind>,
        /// (信号量 id, 值)
        waits: Vec<(u64, u64)>,
        signals: Vec<(u64, u64)>,
    },
    Wait { semaphores: Vec<(u64, u64)> },
    Acquire { swapchain: u64, image: u32 },
    Present { swapchain: u64, image: u32, waits: Vec<u64> },
    DescriptorWrite { set: u64, binding: u32, first_element: u32, count: u32 },
}

pub struct NullQueue {
    slot: NativeQueueSlot,
}

pub struct NullSemaphore {
    id: u64,
    timeline: bool,
    /// GPU 已完成的值
    completed: AtomicU64,
    /// 已提交、尚未完成的最大值
    pending: AtomicU64,
}

impl NullSemaphore {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct NullBuffer {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl NullBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct NullTexture {
    id: u64,
    desc: TextureDesc,
}

impl NullTexture {
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

pub struct NullSampler {
    id: u64,
}

pub struct NullShader {
    id: u64,
}

pub struct NullPipelineLayout {
    id: u64,
}

pub struct NullPipeline {
    id: u64,
    bind_point: PipelineBindPoint,
}

pub struct NullDescriptorSet {
    id: u64,
}

/// 提交时在内存中执行的操作
#[derive(Clone)]
pub(crate) enum NullOp {
    Write { target: Arc<Mutex<Vec<u8>>>, offset: u64, data: Vec<u8> },
    Copy { src: Arc<Mutex<Vec<u8>>>, dst: Arc<Mutex<Vec<u8>>>, regions: Vec<BufferCopyRegion> },
}

impl NullOp {
    fn execute(&self) {
        match self {
            NullOp::Write { target, offset, data } => {
                let mut target = lock(target);
                copy_clamped(&mut target, *offset, data);
            }
            NullOp::Copy { src, dst, regions } => {
                let source: Vec<u8> = lock(src).clone();
                let mut dst = lock(dst);
                for region in regions {
                    let start = (region.src_offset as usize).min(source.len());
                    let end = (region.src_offset.saturating_add(region.size) as usize).min(source.len());
                    copy_clamped(&mut dst, region.dst_offset, &source[start..end]);
                }
            }
        }
    }
}

fn copy_clamped(target: &mut [u8], offset: u64, data: &[u8]) {
    let start = (offset as usize).min(target.len());
    let len = data.len().min(target.len() - start);
    target[start..start + len].copy_from_slice(&data[..len]);
}

pub struct NullCommandList {
    id: u64,
    family: u32,
    level: CommandListLevel,
    kinds: Vec<CommandKind>,
    ops: Vec<NullOp>,
}

impl NullCommandList {
    /// 最近一次编码录制的命令种类
    pub fn kinds(&self) -> &[CommandKind] {
        &self.kinds
    }

    pub fn family(&self) -> u32 {
        self.family
    }
}

pub struct NullSwapchain {
    id: u64,
    width: u32,
    height: u32,
    image_count: u32,
    next_image: u32,
}

impl NullSwapchain {
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// 模拟后端
pub struct NullBackend {
    completion: NullCompletion,
    layout: QueueLayout,
    next_id: AtomicU64,
    events: Mutex<Vec<NullEvent>>,
    out_of_date: AtomicBool,
    submissions: AtomicU32,
}

impl NullBackend {
    /// 一个典型独立显卡的队列族：图形族 4 条、异步计算族 2 条、专用传输族 1 条
    pub fn default_families() -> Vec<QueueFamilyDesc> {
        vec![
            QueueFamilyDesc { index: 0, graphics: true, compute: true, transfer: true, queue_count: 4 },
            QueueFamilyDesc { index: 1, graphics: false, compute: true, transfer: true, queue_count: 2 },
            QueueFamilyDesc { index: 2, graphics: false, compute: false, transfer: true, queue_count: 1 },
        ]
    }

    /// 使用自定义的队列族创建模拟后端
    pub fn with_families(config: &Config, families: &[QueueFamilyDesc]) -> Result<Self> {
        let layout = QueueLayout::select(families, config.graphics.max_extra_graphics_queues)?;
        debug!(completion = ?config.null_device.completion, families = families.len(), "Null backend created");
        Ok(Self {
            completion: config.null_device.completion,
            layout,
            next_id: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
            out_of_date: AtomicBool::new(false),
            submissions: AtomicU32::new(0),
        })
    }

    /// 事件日志快照
    pub fn events(&self) -> Vec<NullEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    /// 原生提交总次数
    pub fn submission_count(&self) -> u32 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// 让后续的获取 / 呈现返回“过期”
    pub fn set_out_of_date(&self, out_of_date: bool) {
        self.out_of_date.store(out_of_date, Ordering::Relaxed);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, event: NullEvent) {
        trace!(?event, "Null backend event");
        lock(&self.events).push(event);
    }

    fn created(&self, kind: &'static str) -> u64 {
        let id = self.next_id();
        self.record(NullEvent::Create { kind, id });
        id
    }

    fn destroyed(&self, kind: &'static str, id: u64) {
        self.record(NullEvent::Destroy { kind, id });
    }

    fn make_buffer(&self, size: u64) -> NullBuffer {
        NullBuffer {
            id: self.created("buffer"),
            data: Arc::new(Mutex::new(vec![0; size as usize])),
        }
    }
}

impl Backend for NullBackend {
    type Queue = NullQueue;
    type Semaphore = NullSemaphore;
    type Buffer = NullBuffer;
    type Texture = NullTexture;
    type Sampler = NullSampler;
    type Shader = NullShader;
    type PipelineLayout = NullPipelineLayout;
    type Pipeline = NullPipeline;
    type DescriptorSet = NullDescriptorSet;
    type CommandList = NullCommandList;
    type Swapchain = NullSwapchain;
    type Encoder<'a> = NullEncoder<'a>;

    const NAME: &'static str = "null";
    const SHADER_TARGET: ShaderTarget = ShaderTarget::Any;

    fn new(config: &Config) -> Result<Self> {
        Self::with_families(config, &Self::default_families())
    }

    fn queue_layout(&self) -> &QueueLayout {
        &self.layout
    }

    fn native_queue(&self, slot: NativeQueueSlot) -> Result<NullQueue> {
        if !self.layout.unique_slots().contains(&slot) {
            return Err(GraphicsError::DeviceCreation(format!("queue {:?} was not requested", slot)).into());
        }
        Ok(NullQueue { slot })
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<NullSemaphore> {
        let (timeline, initial) = match kind {
            SemaphoreKind::Timeline { initial } => (true, initial),
            SemaphoreKind::Binary => (false, 0),
        };
        Ok(NullSemaphore {
            id: self.created("semaphore"),
            timeline,
            completed: AtomicU64::new(initial),
            pending: AtomicU64::new(initial),
        })
    }

    fn destroy_semaphore(&self, semaphore: NullSemaphore) {
        self.destroyed("semaphore", semaphore.id);
    }

    fn semaphore_value(&self, semaphore: &NullSemaphore) -> Result<u64> {
        Ok(semaphore.completed.load(Ordering::Acquire))
    }

    fn signal_semaphore(&self, semaphore: &NullSemaphore, value: u64) -> Result<()> {
        semaphore.pending.fetch_max(value, Ordering::AcqRel);
        semaphore.completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    fn wait_semaphores(&self, waits: &[(&NullSemaphore, u64)], _timeout: Duration) -> Result<WaitStatus> {
        self.record(NullEvent::Wait {
            semaphores: waits.iter().map(|(s, v)| (s.id, *v)).collect(),
        });

        for (semaphore, value) in waits {
            if semaphore.completed.load(Ordering::Acquire) >= *value {
                continue;
            }
            let lazy = self.completion == NullCompletion::Lazy;
            if lazy && semaphore.pending.load(Ordering::Acquire) >= *value {
                // GPU “恰好”执行到被等待的值
                semaphore.completed.fetch_max(*value, Ordering::AcqRel);
            } else {
                return Ok(WaitStatus::Timeout);
            }
        }
        Ok(WaitStatus::Ready)
    }

    fn submit(&self, queue: &NullQueue, batch: &SubmitBatch<'_, Self>) -> Result<()> {
        self.submissions.fetch_add(1, Ordering::Relaxed);

        let mut commands = Vec::new();
        for list in &batch.command_lists {
            if list.family != queue.slot.family {
                return Err(GraphicsError::CommandExecution(format!(
                    "command list {} recorded for family {} submitted to family {}",
                    list.id, list.family, queue.slot.family
                ))
                .into());
            }
            commands.extend_from_slice(&list.kinds);
            for op in &list.ops {
                op.execute();
            }
        }

        for signal in &batch.signals {
            let semaphore = signal.semaphore;
            if !semaphore.timeline {
                continue;
            }
            semaphore.pending.fetch_max(signal.value, Ordering::AcqRel);
            if self.completion == NullCompletion::Immediate {
                semaphore.completed.fetch_max(signal.value, Ordering::AcqRel);
            }
        }

        self.record(NullEvent::Submit {
            queue: queue.slot,
            commands,
            waits: batch.waits.iter().map(|w| (w.semaphore.id, w.value)).collect(),
            signals: batch.signals.iter().map(|s| (s.semaphore.id, s.value)).collect(),
        });
        Ok(())
    }

    fn create_command_list(&self, family: u32, level: CommandListLevel) -> Result<NullCommandList> {
        Ok(NullCommandList {
            id: self.created("command list"),
            family,
            level,
            kinds: Vec::new(),
            ops: Vec::new(),
        })
    }

    fn destroy_command_list(&self, list: NullCommandList) {
        self.destroyed("command list", list.id);
    }

    fn begin_encoding<'a>(
        &'a self,
        list: &'a mut NullCommandList,
        ctx: EncodeContext<'a, Self>,
    ) -> Result<NullEncoder<'a>> {
        list.kinds.clear();
        list.ops.clear();
        Ok(NullEncoder::new(self, list, ctx))
    }

    fn end_encoding<'a>(&'a self, encoder: NullEncoder<'a>) -> Result<Vec<NullBuffer>> {
        Ok(encoder.finish())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NullBuffer> {
        Ok(self.make_buffer(desc.size))
    }

    fn destroy_buffer(&self, buffer: NullBuffer) {
        self.destroyed("buffer", buffer.id);
    }

    fn write_buffer(&self, buffer: &NullBuffer, offset: u64, data: &[u8]) -> Result<()> {
        copy_clamped(&mut lock(&buffer.data), offset, data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &NullBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let data = lock(&buffer.data);
        let start = (offset as usize).min(data.len());
        let len = out.len().min(data.len() - start);
        out[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<NullTexture> {
        Ok(NullTexture { id: self.created("texture"), desc: desc.clone() })
    }

    fn destroy_texture(&self, texture: NullTexture) {
        self.destroyed("texture", texture.id);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<NullSampler> {
        Ok(NullSampler { id: self.created("sampler") })
    }

    fn destroy_sampler(&self, sampler: NullSampler) {
        self.destroyed("sampler", sampler.id);
    }

    fn create_shader(&self, _shader: &CompiledShader) -> Result<NullShader> {
        Ok(NullShader { id: self.created("shader") })
    }

    fn destroy_shader(&self, shader: NullShader) {
        self.destroyed("shader", shader.id);
    }

    fn create_pipeline_layout(&self, _desc: &PipelineLayoutDesc) -> Result<NullPipelineLayout> {
        Ok(NullPipelineLayout { id: self.created("pipeline layout") })
    }

    fn destroy_pipeline_layout(&self, layout: NullPipelineLayout) {
        self.destroyed("pipeline layout", layout.id);
    }

    fn create_graphics_pipeline(
        &self,
        _desc: &GraphicsPipelineDesc,
        _shader: &NullShader,
        _shader_info: &CompiledShader,
        _layout: &NullPipelineLayout,
    ) -> Result<NullPipeline> {
        Ok(NullPipeline { id: self.created("pipeline"), bind_point: PipelineBindPoint::Graphics })
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDesc,
        _shader: &NullShader,
        _shader_info: &CompiledShader,
        _layout: &NullPipelineLayout,
    ) -> Result<NullPipeline> {
        Ok(NullPipeline { id: self.created("pipeline"), bind_point: PipelineBindPoint::Compute })
    }

    fn destroy_pipeline(&self, pipeline: NullPipeline) {
        self.destroyed("pipeline", pipeline.id);
    }

    fn create_descriptor_set(
        &self,
        _layout: &NullPipelineLayout,
        _set_index: u32,
        _desc: &DescriptorSetLayoutDesc,
    ) -> Result<NullDescriptorSet> {
        Ok(NullDescriptorSet { id: self.created("descriptor set") })
    }

    fn destroy_descriptor_set(&self, set: NullDescriptorSet) {
        self.destroyed("descriptor set", set.id);
    }

    fn write_descriptor_buffers(
        &self,
        set: &NullDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[BufferWrite<'_, Self>],
    ) {
        self.record(NullEvent::DescriptorWrite {
            set: set.id,
            binding: binding.binding,
            first_element,
            count: writes.len() as u32,
        });
    }

    fn write_descriptor_images(
        &self,
        set: &NullDescriptorSet,
        binding: &DescriptorBinding,
        first_element: u32,
        writes: &[ImageWrite<'_, Self>],
    ) {
        self.record(NullEvent::DescriptorWrite {
            set: set.id,
            binding: binding.binding,
            first_element,
            count: writes.len() as u32,
        });
    }

    fn create_swapchain(
        &self,
        _window: RawWindowHandle,
        _display: RawDisplayHandle,
        desc: &SwapchainDesc,
        _present_queue: &NullQueue,
    ) -> Result<NullSwapchain> {
        Ok(NullSwapchain {
            id: self.created("swapchain"),
            width: desc.width,
            height: desc.height,
            image_count: desc.image_count.max(1),
            next_image: 0,
        })
    }

    fn resize_swapchain(&self, swapchain: &mut NullSwapchain, width: u32, height: u32) -> Result<()> {
        swapchain.width = width;
        swapchain.height = height;
        swapchain.next_image = 0;
        Ok(())
    }

    fn destroy_swapchain(&self, swapchain: NullSwapchain) {
        self.destroyed("swapchain", swapchain.id);
    }

    fn acquire_next_image(
        &self,
        swapchain: &mut NullSwapchain,
        _signal: &NullSemaphore,
        _timeout: Duration,
    ) -> Result<AcquireResult> {
        if self.out_of_date.load(Ordering::Relaxed) {
            return Ok(AcquireResult::OutOfDate);
        }
        let image = swapchain.next_image;
        swapchain.next_image = (image + 1) % swapchain.image_count;
        self.record(NullEvent::Acquire { swapchain: swapchain.id, image });
        Ok(AcquireResult::Acquired(image))
    }

    fn present(
        &self,
        _queue: &NullQueue,
        swapchain: &NullSwapchain,
        image: u32,
        waits: &[&NullSemaphore],
    ) -> Result<PresentResult> {
        self.record(NullEvent::Present {
            swapchain: swapchain.id,
            image,
            waits: waits.iter().map(|s| s.id).collect(),
        });
        if self.out_of_date.load(Ordering::Relaxed) {
            return Ok(PresentResult::OutOfDate);
        }
        Ok(PresentResult::Presented)
    }
}

impl NullPipeline {
    pub fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }
}

impl NullSampler {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl NullShader {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl NullPipelineLayout {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl NullDescriptorSet {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(completion: NullCompletion) -> NullBackend {
        let mut config = Config::default();
        config.null_device.completion = completion;
        NullBackend::new(&config).unwrap()
    }

    #[test]
    fn test_default_families_are_dedicated() {
        let backend = backend(NullCompletion::Immediate);
        let caps = backend.queue_layout().capabilities;
        assert_eq!(caps.transfer, crate::queue::QueueAliasing::Dedicated);
        assert_eq!(caps.compute, crate::queue::QueueAliasing::Dedicated);
        assert_eq!(caps.extra_graphics_queues, 2);
    }

    #[test]
    fn test_lazy_wait_completes_exactly_to_waited_value() {
        let backend = backend(NullCompletion::Lazy);
        let semaphore = backend.create_semaphore(SemaphoreKind::Timeline { initial: 0 }).unwrap();
        semaphore.pending.store(5, Ordering::Relaxed);

        let status = backend.wait_semaphores(&[(&semaphore, 3)], Duration::from_secs(1)).unwrap();
        assert_eq!(status, WaitStatus::Ready);
        assert_eq!(backend.semaphore_value(&semaphore).unwrap(), 3);

        let status = backend.wait_semaphores(&[(&semaphore, 6)], Duration::from_secs(1)).unwrap();
        assert_eq!(status, WaitStatus::Timeout);
    }

    #[test]
    fn test_immediate_wait_on_unsignaled_value_times_out() {
        let backend = backend(NullCompletion::Immediate);
        let semaphore = backend.create_semaphore(SemaphoreKind::Timeline { initial: 1 }).unwrap();
        assert_eq!(
            backend.wait_semaphores(&[(&semaphore, 1)], Duration::ZERO).unwrap(),
            WaitStatus::Ready
        );
        assert_eq!(
            backend.wait_semaphores(&[(&semaphore, 2)], Duration::ZERO).unwrap(),
            WaitStatus::Timeout
        );
        backend.signal_semaphore(&semaphore, 2).unwrap();
        assert_eq!(backend.semaphore_value(&semaphore).unwrap(), 2);
    }

    #[test]
    fn test_swapchain_rotates_images() {
        let backend = backend(NullCompletion::Immediate);
        let semaphore = backend.create_semaphore(SemaphoreKind::Binary).unwrap();
        let mut swapchain = NullSwapchain { id: 0, width: 4, height: 4, image_count: 3, next_image: 0 };

        let images: Vec<_> = (0..4)
            .map(|_| backend.acquire_next_image(&mut swapchain, &semaphore, Duration::ZERO).unwrap())
            .collect();
        assert_eq!(
            images,
            vec![
                AcquireResult::Acquired(0),
                AcquireResult::Acquired(1),
                AcquireResult::Acquired(2),
                AcquireResult::Acquired(0),
            ]
        );

        backend.set_out_of_date(true);
        assert_eq!(
            backend.acquire_next_image(&mut swapchain, &semaphore, Duration::ZERO).unwrap(),
            AcquireResult::OutOfDate
        );
    }

    #[test]
    fn test_copy_ops_clamp_to_buffer_bounds() {
        let src = Arc::new(Mutex::new(vec![1, 2, 3, 4]));
        let dst = Arc::new(Mutex::new(vec![0; 3]));
        NullOp::Copy {
            src: src.clone(),
            dst: dst.clone(),
            regions: vec![BufferCopyRegion { src_offset: 1, dst_offset: 1, size: 8 }],
        }
        .execute();
        assert_eq!(*dst.lock().unwrap(), vec![0, 2, 3]);

        // 源与目标相同的拷贝不会死锁
        NullOp::Copy {
            src: dst.clone(),
            dst: dst.clone(),
            regions: vec![BufferCopyRegion { src_offset: 1, dst_offset: 0, size: 2 }],
        }
        .execute();
        assert_eq!(*dst.lock().unwrap(), vec![2, 3, 3]);
    }
}
