use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    channel::Channel,
    error::{ChannelError, Result},
    lifecycle::CommunicationObject,
};

/// 工厂持有的通道登记表。
///
/// - 登记表持有通道的强引用，工厂关闭时一次性取走全部通道做批量关闭；
/// - 通道通过 [`TrackedSlot`] 在自身关闭或中止时注销，登记表关闭后注销为空操作；
/// - 关闭后的登记表拒绝新的通道。
pub struct ChannelTracker {
    channels: Mutex<Option<HashMap<u64, Arc<dyn Channel>>>>,
    next_id: AtomicU64,
}

/// 通道在登记表中的位置，由通道自身持有。
pub struct TrackedSlot {
    tracker: Weak<ChannelTracker>,
    id: u64,
}

impl TrackedSlot {
    /// 从登记表中移除，可重复调用。
    pub fn release(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove(self.id);
        }
    }
}

impl fmt::Debug for TrackedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedSlot").field("id", &self.id).finish()
    }
}

impl ChannelTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(0),
        })
    }

    /// 预留一个槽位，通道构造完成后以 [`track`](Self::track) 登记。
    pub fn reserve(self: &Arc<Self>) -> TrackedSlot {
        TrackedSlot {
            tracker: Arc::downgrade(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn track(&self, slot: &TrackedSlot, channel: Arc<dyn Channel>) -> Result<()> {
        match self.channels.lock().as_mut() {
            Some(channels) => {
                channels.insert(slot.id, channel);
                Ok(())
            }
            None => Err(ChannelError::aborted("channel factory is closing and accepts no new channels")),
        }
    }

    fn remove(&self, id: u64) {
        if let Some(channels) = self.channels.lock().as_mut() {
            channels.remove(&id);
        }
    }

    /// 关闭登记表并取走全部通道。
    pub fn close(&self) -> Vec<Arc<dyn CommunicationObject>> {
        self.channels
            .lock()
            .take()
            .map(|channels| {
                channels
                    .into_values()
                    .map(|channel| channel as Arc<dyn CommunicationObject>)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ChannelTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTracker").field("channels", &self.len()).finish()
    }
}
