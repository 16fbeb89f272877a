//! 命令流的创建、关闭与销毁

use tracing::{debug, error, warn};

use super::tables::{Resources, TextureEntry};
use super::Device;
use crate::backend::{Backend, CommandListLevel, EncodeContext};
use crate::command::{replay, Command, CommandStream, CommandStreamDesc};
use crate::core::error::Result;
use crate::core::sync::{lock, read};
use crate::handle::{CommandStreamHandle, SwapchainHandle};
use crate::queue::QueueType;

/// 设备侧的命令流状态
pub(super) struct StreamSlot<B: Backend> {
    pub(super) queue_type: QueueType,
    pub(super) level: CommandListLevel,
    pub(super) family: u32,
    /// 每个飞行帧一个原生命令列表，编码期间被临时取出
    pub(super) lists: Vec<Option<B::CommandList>>,
    /// 最近一次关闭时的总帧计数
    pub(super) closed_frame: Option<u64>,
    /// 最近一次关闭时的命令条数
    pub(super) recorded: usize,
    /// 最近一次关闭时写入的交换链
    pub(super) touched_swapchains: Vec<SwapchainHandle>,
    /// 暂存缓冲区及其创建帧
    pub(super) intermediates: Vec<(u64, B::Buffer)>,
}

impl<B: Backend> StreamSlot<B> {
    pub(super) fn release(self, backend: &B) {
        for list in self.lists.into_iter().flatten() {
            backend.destroy_command_list(list);
        }
        for (_, buffer) in self.intermediates {
            backend.destroy_buffer(buffer);
        }
    }

    pub(super) fn is_closed_in(&self, frame: u64) -> bool {
        self.closed_frame == Some(frame)
    }
}

/// 命令流写入的交换链（通过代理纹理识别）
fn touched_swapchains<B: Backend>(resources: &Resources<B>, stream: &CommandStream) -> Vec<SwapchainHandle> {
    let mut touched = Vec::new();
    for texture in stream.written_textures() {
        if let Some(TextureEntry::Swapchain(swapchain)) = resources.textures.get(texture) {
            if !touched.contains(swapchain) {
                touched.push(*swapchain);
            }
        }
    }
    touched
}

impl<B: Backend> Device<B> {
    /// 创建命令流
    ///
    /// 描述中为 0 的容量使用 `[command_stream]` 配置的默认值。
    /// 设备为每个飞行帧分配一个原生命令列表。
    pub fn create_command_stream(&self, desc: &CommandStreamDesc) -> Result<CommandStream> {
        let defaults = &self.config.command_stream;
        let desc = CommandStreamDesc {
            queue_type: desc.queue_type,
            command_capacity: if desc.command_capacity == 0 { defaults.command_capacity } else { desc.command_capacity },
            aux_memory_bytes: if desc.aux_memory_bytes == 0 { defaults.aux_memory_bytes } else { desc.aux_memory_bytes },
            constant_block_bytes: if desc.constant_block_bytes == 0 {
                defaults.constant_block_bytes
            } else {
                desc.constant_block_bytes
            },
        };

        let layout = self.backend.queue_layout();
        let (family, level) = match desc.queue_type {
            QueueType::Secondary => (layout.graphics.family, CommandListLevel::Secondary),
            ty => (layout.primary(ty).family, CommandListLevel::Primary),
        };

        let _guard = self.creation_guard();
        let mut lists = Vec::with_capacity(self.frames_in_flight());
        for _ in 0..self.frames_in_flight() {
            match self.backend.create_command_list(family, level) {
                Ok(list) => lists.push(Some(list)),
                Err(e) => {
                    for list in lists.into_iter().flatten() {
                        self.backend.destroy_command_list(list);
                    }
                    return Err(e);
                }
            }
        }

        let handle = lock(&self.streams).add(StreamSlot {
            queue_type: desc.queue_type,
            level,
            family,
            lists,
            closed_frame: None,
            recorded: 0,
            touched_swapchains: Vec::new(),
            intermediates: Vec::new(),
        });

        debug!(
            ?handle,
            queue_type = desc.queue_type.name(),
            capacity = desc.command_capacity,
            "Command stream created"
        );
        Ok(CommandStream::new(handle, &desc))
    }

    /// 销毁命令流并释放对应的原生命令列表与暂存缓冲区
    ///
    /// 调用方需要保证没有仍在执行的 GPU 工作引用该命令流。
    pub fn destroy_command_stream(&self, stream: CommandStream) {
        let handle = stream.handle();
        let _guard = self.creation_guard();
        let Some(slot) = lock(&self.streams).remove(handle) else {
            error!(?handle, "Destroying an invalid command stream handle");
            return;
        };
        slot.release(&self.backend);
    }

    /// 把命令流翻译成原生命令列表
    ///
    /// 空命令流直接跳过。二级命令流必须先于引用它的主命令流关闭。
    pub fn close_command_streams(&self, streams: &[&CommandStream]) -> Result<()> {
        let frame = read(&self.frame);
        let frame_index = frame.frame_index();
        let total_frames = frame.total_frames();

        let resources = lock(&self.resources);
        let swapchains = lock(&self.swapchains);
        let mut table = lock(&self.streams);

        for stream in streams {
            let handle = stream.handle();
            let Some(slot) = table.get_mut(handle) else {
                error!(?handle, "Closing an invalid command stream handle");
                continue;
            };
            slot.closed_frame = Some(total_frames);
            slot.recorded = stream.len();

            if stream.is_empty() {
                slot.touched_swapchains.clear();
                continue;
            }
            if stream.is_in_render_pass() {
                warn!(?handle, "Command stream closed inside an open render pass");
            }

            let Some(mut list) = slot.lists[frame_index].take() else {
                error!(?handle, frame_index, "Command list is already being encoded");
                continue;
            };
            let level = slot.level;
            let touched = touched_swapchains(&resources, stream);

            let secondaries: Vec<(CommandStreamHandle, &B::CommandList)> = stream
                .commands()
                .iter()
                .filter_map(|command| match command {
                    Command::ExecuteSecondary(secondary) => Some(*secondary),
                    _ => None,
                })
                .filter_map(|secondary| {
                    let slot = table.get(secondary)?;
                    if slot.level != CommandListLevel::Secondary || !slot.is_closed_in(total_frames) {
                        error!(?handle, ?secondary, "Secondary stream must be closed before the primary using it");
                        return None;
                    }
                    // 空的二级命令流没有重新编码，原生列表里还是上一轮的命令
                    if slot.recorded == 0 {
                        debug!(?handle, ?secondary, "Empty secondary stream skipped");
                        return None;
                    }
                    slot.lists[frame_index].as_ref().map(|list| (secondary, list))
                })
                .collect();

            let ctx = EncodeContext {
                resources: &*resources,
                swapchains: &*swapchains,
                secondaries: &secondaries,
                touched_swapchains: &touched,
                frame: total_frames,
                level,
            };
            let encoded = self.backend.begin_encoding(&mut list, ctx).and_then(|mut encoder| {
                replay(stream, &mut encoder);
                self.backend.end_encoding(encoder)
            });
            drop(secondaries);

            let Some(slot) = table.get_mut(handle) else {
                continue;
            };
            slot.lists[frame_index] = Some(list);
            slot.touched_swapchains = touched;
            match encoded {
                Ok(intermediates) => {
                    slot.intermediates
                        .extend(intermediates.into_iter().map(|buffer| (total_frames, buffer)));
                }
                Err(e) => {
                    slot.recorded = 0;
                    error!(?handle, "Failed to encode command stream: {}", e);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// 命令流当前持有的暂存缓冲区数量
    pub fn intermediate_count(&self, handle: CommandStreamHandle) -> usize {
        lock(&self.streams)
            .get(handle)
            .map_or(0, |slot| slot.intermediates.len())
    }
}
