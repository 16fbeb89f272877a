use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle,
    WebDisplayHandle, WebWindowHandle, WindowHandle,
};
use std::time::Duration;

use super::Device;
use crate::backend::null::{NullBackend, NullEvent};
use crate::backend::{Backend, WaitStatus};
use crate::command::{ColorAttachment, CommandKind, CommandStream, CommandStreamDesc, LoadOp, Scissor, StoreOp};
use crate::core::config::{Config, NullCompletion};
use crate::core::error::{DescriptorUpdateError, DistRhiError};
use crate::queue::{NativeQueueSlot, QueueType, SemaphoreValue, SubmitDesc};
use crate::resource::{
    BufferBinding, BufferDesc, BufferUsage, DescriptorBinding, DescriptorSetLayoutDesc, DescriptorType,
    ImageBinding, MemoryLocation, PipelineLayoutDesc, SamplerDesc,
};
use crate::shader::ShaderStages;
use crate::swapchain::{PresentDesc, SwapchainDesc};

/// 只提供句柄的测试窗口
struct TestWindow;

impl HasWindowHandle for TestWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Ok(unsafe { WindowHandle::borrow_raw(RawWindowHandle::Web(WebWindowHandle::new(1))) })
    }
}

impl HasDisplayHandle for TestWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Ok(unsafe { DisplayHandle::borrow_raw(RawDisplayHandle::Web(WebDisplayHandle::new())) })
    }
}

fn device(completion: NullCompletion) -> Device<NullBackend> {
    let mut config = Config::default();
    config.null_device.completion = completion;
    Device::new(&config).unwrap()
}

fn readback_buffer(device: &Device<NullBackend>, size: u64) -> crate::handle::BufferHandle {
    device
        .create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_DST | BufferUsage::STORAGE,
            memory: MemoryLocation::GpuToCpu,
            name: None,
        })
        .unwrap()
}

fn graphics_stream(device: &Device<NullBackend>) -> CommandStream {
    device
        .create_command_stream(&CommandStreamDesc::new(QueueType::Graphics))
        .unwrap()
}

fn submit_one(device: &Device<NullBackend>, stream: &CommandStream) {
    device.close_command_streams(&[stream]).unwrap();
    device
        .submit(&SubmitDesc::new(device.primary_queue(QueueType::Graphics), &[stream.handle()]))
        .unwrap();
}

fn count_events(device: &Device<NullBackend>, pred: impl Fn(&NullEvent) -> bool) -> usize {
    device.backend().events().iter().filter(|e| pred(e)).count()
}

#[test]
fn test_frame_loop_advances_and_signals_timeline() {
    let device = device(NullCompletion::Immediate);
    let mut stream = graphics_stream(&device);
    let queue = device.primary_queue(QueueType::Graphics);

    for frame in 0..5u64 {
        device.start_frame().unwrap();
        stream.reset();
        stream.dispatch(1, 1, 1);
        submit_one(&device, &stream);
        device.end_frame();

        let progress = device.queue_progress(queue).unwrap();
        assert_eq!(progress.submitted, frame + 1);
        assert_eq!(progress.completed, frame + 1);
    }

    assert_eq!(device.total_frames(), 5);
    assert_eq!(device.frame_index(), 5 % 2);
    assert_eq!(device.backend().submission_count(), 5);
    device.destroy_command_stream(stream);
}

#[test]
fn test_lazy_completion_throttles_to_frames_in_flight() {
    let device = device(NullCompletion::Lazy);
    let mut stream = graphics_stream(&device);
    let queue = device.primary_queue(QueueType::Graphics);

    for _ in 0..3 {
        device.start_frame().unwrap();
        stream.reset();
        stream.dispatch(1, 1, 1);
        submit_one(&device, &stream);
        device.end_frame();
    }

    // 第三帧开始时只等到了第一帧的值
    let progress = device.queue_progress(queue).unwrap();
    assert_eq!(progress.submitted, 3);
    assert_eq!(progress.completed, 1);

    device.join().unwrap();
    assert_eq!(device.queue_progress(queue).unwrap().completed, 3);
    device.destroy_command_stream(stream);
}

#[test]
fn test_restarting_a_frame_waits_for_its_own_submission() {
    let device = device(NullCompletion::Lazy);
    let mut stream = graphics_stream(&device);

    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    submit_one(&device, &stream);
    device.backend().clear_events();

    device.start_frame().unwrap();
    let waits: Vec<_> = device
        .backend()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NullEvent::Wait { semaphores } => Some(semaphores),
            _ => None,
        })
        .collect();
    assert_eq!(waits.len(), 1);
    assert_eq!(waits[0].len(), 1);
    assert_eq!(waits[0][0].1, 1);
    device.destroy_command_stream(stream);
}

#[test]
fn test_update_buffer_is_visible_after_submission() {
    let device = device(NullCompletion::Immediate);
    let buffer = readback_buffer(&device, 16);
    let mut stream = graphics_stream(&device);

    device.start_frame().unwrap();
    stream.update_buffer(buffer, 4, &[1, 2, 3, 4]);
    submit_one(&device, &stream);
    device.end_frame();

    let mut out = [0u8; 8];
    device.read_buffer(buffer, 0, &mut out).unwrap();
    assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);

    device.destroy_command_stream(stream);
    device.destroy_buffer(buffer);
}

#[test]
fn test_intermediates_are_reclaimed_after_frames_in_flight() {
    let device = device(NullCompletion::Immediate);
    let buffer = readback_buffer(&device, 64);
    let mut stream = graphics_stream(&device);
    let frames_in_flight = device.config().frames_in_flight();

    for frame in 0..10u8 {
        device.start_frame().unwrap();
        stream.reset();
        stream.update_buffer(buffer, 0, &[frame; 16]);
        submit_one(&device, &stream);
        assert!(device.intermediate_count(stream.handle()) <= frames_in_flight + 1);
        device.end_frame();
    }
    assert_eq!(device.intermediate_count(stream.handle()), frames_in_flight + 1);

    device.destroy_command_stream(stream);
    device.destroy_buffer(buffer);
}

#[test]
#[should_panic(expected = "Exceeded max submissions per frame")]
fn test_exceeding_submission_limit_is_fatal() {
    let mut config = Config::default();
    config.graphics.max_submissions_per_frame = 2;
    let device: Device<NullBackend> = Device::new(&config).unwrap();
    let mut stream = graphics_stream(&device);

    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.close_command_streams(&[&stream]).unwrap();
    let desc = SubmitDesc::new(device.primary_queue(QueueType::Graphics), &[stream.handle()]);
    for _ in 0..3 {
        device.submit(&desc).unwrap();
    }
}

#[test]
fn test_unclosed_and_empty_streams_are_not_submitted() {
    let device = device(NullCompletion::Immediate);
    let mut stream = graphics_stream(&device);
    let queue = device.primary_queue(QueueType::Graphics);

    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.submit(&SubmitDesc::new(queue, &[stream.handle()])).unwrap();
    assert_eq!(device.backend().submission_count(), 0);

    stream.reset();
    device.close_command_streams(&[&stream]).unwrap();
    device.submit(&SubmitDesc::new(queue, &[stream.handle()])).unwrap();
    assert_eq!(device.backend().submission_count(), 0);
    device.destroy_command_stream(stream);
}

#[test]
fn test_secondary_stream_runs_through_its_primary() {
    let device = device(NullCompletion::Immediate);
    let buffer = readback_buffer(&device, 4);
    let queue = device.primary_queue(QueueType::Graphics);
    let mut secondary = device
        .create_command_stream(&CommandStreamDesc::new(QueueType::Secondary))
        .unwrap();
    let mut primary = graphics_stream(&device);

    device.start_frame().unwrap();
    secondary.update_buffer(buffer, 0, &[9, 9, 9, 9]);
    primary.execute_secondary(&secondary);
    device.close_command_streams(&[&secondary, &primary]).unwrap();

    // 二级命令流不能直接提交
    device.submit(&SubmitDesc::new(queue, &[secondary.handle()])).unwrap();
    assert_eq!(device.backend().submission_count(), 0);

    device.submit(&SubmitDesc::new(queue, &[primary.handle()])).unwrap();
    device.end_frame();

    let mut out = [0u8; 4];
    device.read_buffer(buffer, 0, &mut out).unwrap();
    assert_eq!(out, [9; 4]);
    assert_eq!(device.primary_queue(QueueType::Secondary), crate::handle::QueueHandle::INVALID);

    device.destroy_command_stream(primary);
    device.destroy_command_stream(secondary);
    device.destroy_buffer(buffer);
}

#[test]
fn test_stream_is_rejected_on_a_foreign_family() {
    let device = device(NullCompletion::Immediate);
    let mut stream = graphics_stream(&device);

    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.close_command_streams(&[&stream]).unwrap();
    let result = device.submit(&SubmitDesc::new(device.primary_queue(QueueType::Transfer), &[stream.handle()]));
    assert!(result.is_err());
    device.destroy_command_stream(stream);
}

#[test]
fn test_user_semaphores_are_passed_through() {
    let device = device(NullCompletion::Immediate);
    let mut stream = graphics_stream(&device);
    let semaphore = device.create_semaphore(0).unwrap();

    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.close_command_streams(&[&stream]).unwrap();
    let mut desc = SubmitDesc::new(device.primary_queue(QueueType::Graphics), &[stream.handle()]);
    desc.signals.push(SemaphoreValue { semaphore, value: 5 });
    device.submit(&desc).unwrap();

    assert_eq!(device.semaphore_value(semaphore).unwrap(), 5);
    assert_eq!(
        device.wait_semaphore(semaphore, 5, Duration::from_millis(10)).unwrap(),
        WaitStatus::Ready
    );
    assert_eq!(
        device.wait_semaphore(semaphore, 6, Duration::from_millis(10)).unwrap(),
        WaitStatus::Timeout
    );

    let signals = device
        .backend()
        .events()
        .into_iter()
        .find_map(|e| match e {
            NullEvent::Submit { signals, .. } => Some(signals),
            _ => None,
        })
        .unwrap();
    // 队列时间线 + 用户信号量
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[1].1, 5);

    device.destroy_command_stream(stream);
    device.destroy_semaphore(semaphore);
}

#[test]
fn test_rejected_descriptor_update_makes_no_native_write() {
    let device = device(NullCompletion::Immediate);
    let layout = device
        .create_pipeline_layout(&PipelineLayoutDesc {
            sets: vec![DescriptorSetLayoutDesc {
                bindings: vec![DescriptorBinding {
                    binding: 0,
                    ty: DescriptorType::UniformBuffer,
                    count: 1,
                    stages: ShaderStages::ALL_GRAPHICS,
                }],
            }],
            push_constants: Vec::new(),
        })
        .unwrap();
    let set = device.create_descriptor_set(layout, 0).unwrap();
    let buffer = readback_buffer(&device, 64);
    let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
    let is_write = |e: &NullEvent| matches!(e, NullEvent::DescriptorWrite { .. });

    let wrong_type = device.update_descriptor_images(set, 0, 0, &[ImageBinding::sampler(sampler)]);
    assert!(matches!(
        wrong_type,
        Err(DistRhiError::Descriptor(DescriptorUpdateError::TypeMismatch { binding: 0, .. }))
    ));

    let too_many = device.update_descriptor_buffers(set, 0, 0, &[BufferBinding::whole(buffer); 2]);
    assert!(matches!(
        too_many,
        Err(DistRhiError::Descriptor(DescriptorUpdateError::CountExceeded { requested: 2, declared: 1, .. }))
    ));

    let missing = device.update_descriptor_buffers(set, 3, 0, &[BufferBinding::whole(buffer)]);
    assert!(matches!(
        missing,
        Err(DistRhiError::Descriptor(DescriptorUpdateError::BindingOutOfRange { binding: 3 }))
    ));

    let past_end = BufferBinding { buffer, offset: 32, range: Some(64) };
    let out_of_bounds = device.update_descriptor_buffers(set, 0, 0, &[past_end]);
    assert!(matches!(
        out_of_bounds,
        Err(DistRhiError::Descriptor(DescriptorUpdateError::InvalidResource { binding: 0 }))
    ));
    assert_eq!(count_events(&device, is_write), 0);

    device.update_descriptor_buffers(set, 0, 0, &[BufferBinding::whole(buffer)]).unwrap();
    assert_eq!(count_events(&device, is_write), 1);

    assert!(device.create_descriptor_set(layout, 1).is_err());

    device.destroy_descriptor_set(set);
    device.destroy_pipeline_layout(layout);
    device.destroy_sampler(sampler);
    device.destroy_buffer(buffer);
}

#[test]
fn test_swapchain_write_links_acquire_and_present() {
    let device = device(NullCompletion::Immediate);
    let swapchain = device.create_swapchain(&TestWindow, &SwapchainDesc::new(640, 480)).unwrap();
    let target = device.swapchain_texture(swapchain);
    let mut stream = graphics_stream(&device);

    device.start_frame().unwrap();
    assert_eq!(device.swapchain_image(swapchain), Some(0));
    stream.begin_render_pass(
        &[ColorAttachment::new(target, LoadOp::Clear, StoreOp::Store)],
        None,
        Scissor::new(640, 480),
    );
    stream.end_render_pass();
    submit_one(&device, &stream);
    device.present(&PresentDesc::new(&[swapchain])).unwrap();
    device.end_frame();

    let events = device.backend().events();
    let (waits, signals) = events
        .iter()
        .find_map(|e| match e {
            NullEvent::Submit { waits, signals, commands, .. } => {
                assert_eq!(commands, &vec![CommandKind::BeginRenderPass, CommandKind::EndRenderPass]);
                Some((waits.clone(), signals.clone()))
            }
            _ => None,
        })
        .unwrap();
    // 等待获取信号量，触发时间线和呈现用的二值信号量
    assert_eq!(waits.len(), 1);
    assert_eq!(signals.len(), 2);

    let present_waits = events
        .iter()
        .find_map(|e| match e {
            NullEvent::Present { waits, image: 0, .. } => Some(waits.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(present_waits, vec![signals[1].0]);

    device.destroy_command_stream(stream);
    device.destroy_swapchain(swapchain);
}

#[test]
fn test_inactive_or_minimized_swapchain_is_skipped() {
    let device = device(NullCompletion::Immediate);
    let swapchain = device.create_swapchain(&TestWindow, &SwapchainDesc::new(320, 240)).unwrap();
    let is_acquire = |e: &NullEvent| matches!(e, NullEvent::Acquire { .. });
    let is_present = |e: &NullEvent| matches!(e, NullEvent::Present { .. });

    let target = device.swapchain_texture(swapchain);
    let mut stream = graphics_stream(&device);

    // 即使本帧有提交写入停用的交换链，也不获取、不呈现
    device.set_swapchain_active(swapchain, false);
    device.start_frame().unwrap();
    stream.begin_render_pass(
        &[ColorAttachment::new(target, LoadOp::Clear, StoreOp::Store)],
        None,
        Scissor::new(320, 240),
    );
    stream.end_render_pass();
    submit_one(&device, &stream);
    device.present(&PresentDesc::new(&[swapchain])).unwrap();
    device.end_frame();
    assert_eq!(device.backend().submission_count(), 1);
    assert_eq!(count_events(&device, is_acquire), 0);
    assert_eq!(count_events(&device, is_present), 0);
    let submit_waits = device
        .backend()
        .events()
        .into_iter()
        .find_map(|e| match e {
            NullEvent::Submit { waits, signals, .. } => Some((waits.len(), signals.len())),
            _ => None,
        })
        .unwrap();
    // 只触发队列时间线
    assert_eq!(submit_waits, (0, 1));
    device.destroy_command_stream(stream);

    device.set_swapchain_active(swapchain, true);
    device.resize_swapchain(swapchain, 0, 0).unwrap();
    device.start_frame().unwrap();
    device.present(&PresentDesc::new(&[swapchain])).unwrap();
    device.end_frame();
    assert_eq!(count_events(&device, is_acquire), 0);
    assert_eq!(count_events(&device, is_present), 0);

    // 本帧没有写入时，呈现直接等待获取信号量
    device.resize_swapchain(swapchain, 320, 240).unwrap();
    device.start_frame().unwrap();
    device.present(&PresentDesc::new(&[swapchain])).unwrap();
    device.end_frame();
    assert_eq!(count_events(&device, is_acquire), 1);
    assert_eq!(count_events(&device, is_present), 1);

    device.destroy_swapchain(swapchain);
}

#[test]
fn test_out_of_date_swapchain_is_reported() {
    let device = device(NullCompletion::Immediate);
    let swapchain = device.create_swapchain(&TestWindow, &SwapchainDesc::new(320, 240)).unwrap();

    device.backend().set_out_of_date(true);
    let result = device.start_frame();
    assert!(matches!(
        result,
        Err(DistRhiError::Graphics(crate::core::error::GraphicsError::SwapchainOutOfDate(_)))
    ));
    assert_eq!(device.swapchain_image(swapchain), None);
    device.end_frame();

    device.backend().set_out_of_date(false);
    device.resize_swapchain(swapchain, 400, 300).unwrap();
    device.start_frame().unwrap();
    assert_eq!(device.swapchain_desc(swapchain).map(|d| d.width), Some(400));
    device.end_frame();

    device.destroy_swapchain(swapchain);
}

#[test]
fn test_extra_graphics_queues_alias_when_exhausted() {
    let device = device(NullCompletion::Immediate);
    assert_eq!(device.queue_capabilities().extra_graphics_queues, 2);

    let queues: Vec<_> = (0..3).map(|_| device.create_queue(QueueType::Graphics).unwrap()).collect();
    assert!(device.create_queue(QueueType::Compute).is_err());

    let mut stream = graphics_stream(&device);
    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.close_command_streams(&[&stream]).unwrap();
    for queue in &queues {
        device.submit(&SubmitDesc::new(*queue, &[stream.handle()])).unwrap();
    }
    device.end_frame();
    assert_eq!(device.backend().submission_count(), 3);

    for queue in queues {
        device.destroy_queue(queue);
    }
    device.destroy_command_stream(stream);
}

#[test]
fn test_destroyed_extra_graphics_queue_returns_to_pool() {
    let device = device(NullCompletion::Immediate);
    let layout = device.backend().queue_layout().clone();
    assert_eq!(layout.extra_graphics.len(), 2);

    let first = device.create_queue(QueueType::Graphics).unwrap();
    let second = device.create_queue(QueueType::Graphics).unwrap();
    device.destroy_queue(first);
    // 归还的硬件队列被重新分配，而不是复用池中最后一条
    let third = device.create_queue(QueueType::Graphics).unwrap();

    let mut stream = graphics_stream(&device);
    device.start_frame().unwrap();
    stream.dispatch(1, 1, 1);
    device.close_command_streams(&[&stream]).unwrap();
    device.backend().clear_events();
    device.submit(&SubmitDesc::new(second, &[stream.handle()])).unwrap();
    device.submit(&SubmitDesc::new(third, &[stream.handle()])).unwrap();
    device.end_frame();

    let slots: Vec<NativeQueueSlot> = device
        .backend()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NullEvent::Submit { queue, .. } => Some(queue),
            _ => None,
        })
        .collect();
    assert_eq!(slots, vec![layout.extra_graphics[1], layout.extra_graphics[0]]);

    device.destroy_queue(second);
    device.destroy_queue(third);
    device.destroy_command_stream(stream);
}

#[test]
fn test_shutdown_releases_leaked_objects() {
    let mut device = device(NullCompletion::Immediate);
    let _buffer = readback_buffer(&device, 16);
    let _sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
    let _stream = graphics_stream(&device);
    device.backend().clear_events();

    device.shutdown();

    let destroyed: Vec<&str> = device
        .backend()
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NullEvent::Destroy { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(destroyed.iter().filter(|k| **k == "buffer").count(), 1);
    assert_eq!(destroyed.iter().filter(|k| **k == "sampler").count(), 1);
    assert_eq!(destroyed.iter().filter(|k| **k == "command list").count(), 2);
    // 三条主队列的时间线
    assert_eq!(destroyed.iter().filter(|k| **k == "semaphore").count(), 3);
}

#[test]
fn test_empty_secondary_does_not_replay_previous_commands() {
    let mut config = Config::default();
    config.graphics.frames_in_flight = 1;
    let device: Device<NullBackend> = Device::new(&config).unwrap();
    let buffer = readback_buffer(&device, 4);
    let mut secondary = device
        .create_command_stream(&CommandStreamDesc::new(QueueType::Secondary))
        .unwrap();
    let mut primary = graphics_stream(&device);
    let queue = device.primary_queue(QueueType::Graphics);

    device.start_frame().unwrap();
    secondary.update_buffer(buffer, 0, &[9; 4]);
    primary.execute_secondary(&secondary);
    device.close_command_streams(&[&secondary, &primary]).unwrap();
    device.submit(&SubmitDesc::new(queue, &[primary.handle()])).unwrap();
    device.end_frame();

    device.write_buffer(buffer, 0, &[1; 4]).unwrap();

    // 同一个原生命令列表槽位，二级命令流这次什么都没录
    device.start_frame().unwrap();
    secondary.reset();
    primary.reset();
    primary.execute_secondary(&secondary);
    device.close_command_streams(&[&secondary, &primary]).unwrap();
    device.submit(&SubmitDesc::new(queue, &[primary.handle()])).unwrap();
    device.end_frame();

    let mut out = [0u8; 4];
    device.read_buffer(buffer, 0, &mut out).unwrap();
    assert_eq!(out, [1; 4]);

    device.destroy_command_stream(primary);
    device.destroy_command_stream(secondary);
    device.destroy_buffer(buffer);
}
