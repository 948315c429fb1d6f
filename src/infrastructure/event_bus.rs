//! 进度事件通道 - 基础设施层
//!
//! TaskManager 与 BlockProcessor 向同一个总线发布事件，消费方按任务（或全部）订阅。
//!
//! 非终态事件走有界广播通道，订阅方落后时可能丢失；
//! 终态事件（任务 completed/failed、区块 block_completed）另外经每个订阅方独占的无界通道送达，不会丢失。
//! 每个事件带全局序号，订阅流按发布顺序交付。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::models::{ProgressEvent, TaskId};

/// 带发布序号的事件
#[derive(Debug, Clone)]
struct Sequenced {
    seq: u64,
    event: ProgressEvent,
}

/// 终态事件的投递目标
struct TerminalSink {
    filter: Option<TaskId>,
    tx: mpsc::UnboundedSender<Sequenced>,
}

impl TerminalSink {
    fn accepts(&self, event: &ProgressEvent) -> bool {
        self.filter.map_or(true, |id| id == event.task_id())
    }
}

struct Registry {
    next_seq: u64,
    sinks: Vec<TerminalSink>,
}

/// 进度事件总线
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Sequenced>,
    /// 发布与订阅都在这把锁内完成，保证序号与两条通道的顺序一致
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            registry: Arc::new(Mutex::new(Registry {
                next_seq: 0,
                sinks: Vec::new(),
            })),
        }
    }

    /// 发布事件；没有订阅者时直接丢弃
    pub fn publish(&self, event: ProgressEvent) {
        let mut registry = self.registry();
        registry.next_seq += 1;
        let item = Sequenced {
            seq: registry.next_seq,
            event,
        };

        if item.event.is_terminal() {
            // 先进无界通道，再进广播：订阅流看到序号 n 时，n 之前的终态事件必已到达
            registry.sinks.retain(|sink| {
                if sink.accepts(&item.event) {
                    sink.tx.send(item.clone()).is_ok()
                } else {
                    !sink.tx.is_closed()
                }
            });
        }

        if self.tx.send(item).is_err() {
            debug!("暂无事件订阅者");
        }
    }

    /// 订阅全部任务的事件
    pub fn subscribe(&self) -> EventStream {
        self.open(None)
    }

    /// 订阅单个任务的事件
    pub fn subscribe_task(&self, task_id: TaskId) -> EventStream {
        self.open(Some(task_id))
    }

    fn open(&self, filter: Option<TaskId>) -> EventStream {
        let mut registry = self.registry();
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        registry.sinks.push(TerminalSink {
            filter,
            tx: terminal_tx,
        });

        EventStream {
            filter,
            rx: self.tx.subscribe(),
            terminal: terminal_rx,
            pending: VecDeque::new(),
            held: None,
            seen: 0,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 订阅方的事件流
pub struct EventStream {
    filter: Option<TaskId>,
    rx: broadcast::Receiver<Sequenced>,
    terminal: mpsc::UnboundedReceiver<Sequenced>,
    /// 已收到、尚未交付的终态事件
    pending: VecDeque<Sequenced>,
    /// 等待排在更早终态事件之后交付的非终态事件
    held: Option<ProgressEvent>,
    /// 广播通道上已观察到的最大序号
    seen: u64,
}

impl EventStream {
    /// 等待下一个事件，总线关闭且终态事件取尽时返回 `None`
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.ready() {
                return Some(event);
            }

            match self.rx.recv().await {
                Ok(item) => self.observe(item),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("订阅者落后 {} 条事件，终态事件不受影响", n);
                }
                Err(broadcast::error::RecvError::Closed) => return self.flush(),
            }
        }
    }

    /// 非阻塞地取出当前已到达的事件
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        loop {
            if let Some(event) = self.ready() {
                events.push(event);
                continue;
            }

            match self.rx.try_recv() {
                Ok(item) => self.observe(item),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    debug!("订阅者落后 {} 条事件，终态事件不受影响", n);
                }
                Err(_) => match self.flush() {
                    Some(event) => events.push(event),
                    None => return events,
                },
            }
        }
    }

    fn accepts(&self, event: &ProgressEvent) -> bool {
        self.filter.map_or(true, |id| id == event.task_id())
    }

    /// 广播上的终态事件只用来推进序号，内容以无界通道为准
    fn observe(&mut self, item: Sequenced) {
        self.seen = self.seen.max(item.seq);
        if !item.event.is_terminal() && self.accepts(&item.event) {
            self.held = Some(item.event);
        }
    }

    /// 按序号交付：序号不超过已观察位置的终态事件优先，其次是暂存的非终态事件
    fn ready(&mut self) -> Option<ProgressEvent> {
        while let Ok(item) = self.terminal.try_recv() {
            self.pending.push_back(item);
        }

        if self.pending.front().is_some_and(|t| t.seq <= self.seen) {
            return self.pending.pop_front().map(|t| t.event);
        }
        self.held.take()
    }

    /// 广播通道已取空：之前发布的事件都已观察过，剩余终态事件可直接交付
    fn flush(&mut self) -> Option<ProgressEvent> {
        self.ready()
            .or_else(|| self.pending.pop_front().map(|t| t.event))
    }
}
