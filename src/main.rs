//! DistRHI 演示程序
//!
//! 打开一个窗口，每帧用随时间变化的颜色清屏，并通过传输队列上传一个帧计数缓冲区。
//! 可以通过配置文件或命令行参数选择图形后端。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件（config.toml）
//! cargo run
//!
//! # 命令行覆盖后端
//! cargo run -- --null
//! cargo run --features dx12 -- --dx12
//! ```

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use dist_rhi::command::{ColorAttachment, CommandStream, CommandStreamDesc, LoadOp, Scissor, StoreOp, Viewport};
use dist_rhi::core::{log, Config};
use dist_rhi::handle::{BufferHandle, SemaphoreHandle, SwapchainHandle};
use dist_rhi::queue::{QueueType, SemaphoreValue, SubmitDesc};
use dist_rhi::resource::{BufferDesc, BufferUsage, MemoryLocation};
use dist_rhi::swapchain::{PresentDesc, SwapchainDesc};
use dist_rhi::Gpu;

struct Demo {
    gpu: Gpu,
    swapchain: SwapchainHandle,
    graphics: CommandStream,
    transfer: CommandStream,
    counter: BufferHandle,
    upload_done: SemaphoreHandle,
    upload_value: u64,
}

impl Demo {
    fn new(gpu: Gpu, window: &winit::window::Window) -> Result<Self> {
        let size = window.inner_size();
        let mut desc = SwapchainDesc::new(size.width, size.height);
        desc.vsync = gpu.config().graphics.vsync;

        let swapchain = gpu.create_swapchain(window, &desc).context("creating swapchain")?;
        let graphics = gpu.create_command_stream(&CommandStreamDesc::new(QueueType::Graphics))?;
        let transfer = gpu.create_command_stream(&CommandStreamDesc::new(QueueType::Transfer))?;
        let counter = gpu.create_buffer(&BufferDesc {
            size: 16,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
            memory: MemoryLocation::GpuOnly,
            name: Some("frame counter".to_string()),
        })?;

        let upload_done = gpu.create_semaphore(0)?;

        Ok(Self { gpu, swapchain, graphics, transfer, counter, upload_done, upload_value: 0 })
    }

    fn render(&mut self) -> Result<()> {
        if let Err(e) = self.gpu.start_frame() {
            if e.is_swapchain_out_of_date() {
                warn!("Skipping frame until the swapchain is recreated");
                self.gpu.end_frame();
                return Ok(());
            }
            return Err(e.into());
        }

        let frame = self.gpu.total_frames();
        let Some(desc) = self.gpu.swapchain_desc(self.swapchain) else {
            self.gpu.end_frame();
            return Ok(());
        };

        self.transfer.reset();
        let values = [frame as u32, 0, 0, 0];
        self.transfer.update_buffer(self.counter, 0, bytemuck::cast_slice(&values));

        let t = frame as f32 * 0.02;
        let color = [0.5 + 0.5 * t.sin(), 0.3, 0.5 + 0.5 * t.cos(), 1.0];
        let target = self.gpu.swapchain_texture(self.swapchain);

        self.graphics.reset();
        self.graphics.begin_render_pass(
            &[ColorAttachment::new(target, LoadOp::Clear, StoreOp::Store).with_clear(color)],
            None,
            Scissor::new(desc.width, desc.height),
        );
        self.graphics.set_viewport(Viewport::new(desc.width as f32, desc.height as f32));
        self.graphics.set_scissor(Scissor::new(desc.width, desc.height));
        self.graphics.end_render_pass();

        self.gpu.close_command_streams(&[&self.transfer, &self.graphics])?;

        self.upload_value += 1;
        let upload_done = SemaphoreValue { semaphore: self.upload_done, value: self.upload_value };

        let mut upload = SubmitDesc::new(self.gpu.primary_queue(QueueType::Transfer), &[self.transfer.handle()]);
        upload.signals.push(upload_done);
        self.gpu.submit(&upload)?;

        let mut draw = SubmitDesc::new(self.gpu.primary_queue(QueueType::Graphics), &[self.graphics.handle()]);
        draw.waits.push(upload_done);
        self.gpu.submit(&draw)?;

        let presented = self.gpu.present(&PresentDesc::new(&[self.swapchain]));
        self.gpu.end_frame();

        match presented {
            Err(e) if e.is_swapchain_out_of_date() => {
                warn!("Swapchain needs to be recreated after present");
                Ok(())
            }
            other => other.map_err(Into::into),
        }
    }

    fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.gpu.resize_swapchain(self.swapchain, width, height)?;
        Ok(())
    }

    fn shutdown(self) -> Result<()> {
        self.gpu.join()?;
        self.gpu.destroy_command_stream(self.graphics);
        self.gpu.destroy_command_stream(self.transfer);
        self.gpu.destroy_buffer(self.counter);
        self.gpu.destroy_semaphore(self.upload_done);
        self.gpu.destroy_swapchain(self.swapchain);
        Ok(())
    }
}

fn main() -> Result<()> {
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("invalid configuration")?;

    let log_file = config.logging.file_output.then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file);
    info!(version = env!("CARGO_PKG_VERSION"), backend = config.graphics.backend.name(), "DistRHI demo starting");

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title("DistRHI")
        .with_inner_size(LogicalSize::new(1280.0, 720.0))
        .build(&event_loop)?;

    let gpu = Gpu::new(&config).context("creating device")?;
    let mut demo = Some(Demo::new(gpu, &window)?);

    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { event: WindowEvent::CloseRequested, .. } => {
            if let Some(demo) = demo.take() {
                if let Err(e) = demo.shutdown() {
                    error!("Shutdown failed: {:#}", e);
                }
            }
            elwt.exit();
        }
        Event::WindowEvent { event: WindowEvent::Resized(size), .. } => {
            if let Some(demo) = demo.as_ref() {
                if let Err(e) = demo.resize(size.width, size.height) {
                    error!("Resize failed: {:#}", e);
                }
            }
        }
        Event::WindowEvent { event: WindowEvent::RedrawRequested, .. } => {
            if let Some(demo) = demo.as_mut() {
                if let Err(e) = demo.render() {
                    error!("Frame failed: {:#}", e);
                    elwt.exit();
                }
            }
        }
        Event::AboutToWait => window.request_redraw(),
        _ => {}
    })?;

    info!("DistRHI demo exited");
    Ok(())
}
