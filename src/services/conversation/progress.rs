//! 进度通道
//!
//! 有序、非阻塞的进度事件队列，由独立的展示任务消费。
//! 关闭通道时发出结束信号，展示任务处理完已入队的事件后退出并被等待。
//! 关闭之后仍存活的 `ProgressSink` 克隆发送的事件会被丢弃。

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub message: String,
}

/// 进度事件的展示方
pub trait ProgressPresenter: Send + 'static {
    /// 展示单个事件
    fn show(&mut self, event: &ProgressEvent);

    /// 所有事件处理完毕
    fn finish(&mut self) {}
}

/// 发送端
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    /// 发送事件，从不阻塞
    pub fn emit(&self, message: impl Into<String>) {
        let event = ProgressEvent {
            message: message.into(),
        };
        if let Err(e) = self.tx.send(event) {
            debug!("Progress presenter already stopped, dropping: {}", e.0.message);
        }
    }
}

/// 进度通道
pub struct ProgressChannel<P: ProgressPresenter> {
    sink: ProgressSink,
    done: oneshot::Sender<()>,
    handle: JoinHandle<P>,
}

impl<P: ProgressPresenter> ProgressChannel<P> {
    /// 打开通道并启动展示任务
    pub fn open(mut presenter: P) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let (done, mut done_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // 先处理已入队的事件，再响应结束信号
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => presenter.show(&event),
                        None => break,
                    },
                    _ = &mut done_rx => {
                        while let Ok(event) = rx.try_recv() {
                            presenter.show(&event);
                        }
                        break;
                    }
                }
            }
            presenter.finish();
            presenter
        });

        Self {
            sink: ProgressSink { tx },
            done,
            handle,
        }
    }

    pub fn sink(&self) -> &ProgressSink {
        &self.sink
    }

    /// 关闭通道，等待展示任务处理完已发送的事件
    ///
    /// 不等待其他 `ProgressSink` 克隆被丢弃。
    pub async fn close(self) -> Result<P, tokio::task::JoinError> {
        drop(self.sink);
        let _ = self.done.send(());
        self.handle.await
    }
}

/// 终端 spinner 展示
pub struct SpinnerPresenter {
    bar: ProgressBar,
    label: String,
    started: Instant,
}

impl SpinnerPresenter {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]") {
            bar.set_style(style);
        }
        bar.set_message(format!("Documenting {}", label));
        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            label,
            started: Instant::now(),
        }
    }
}

impl ProgressPresenter for SpinnerPresenter {
    fn show(&mut self, event: &ProgressEvent) {
        self.bar.println(format!("  {}", event.message));
    }

    fn finish(&mut self) {
        self.bar.finish_with_message(format!(
            "Finished {} in {:.2}s",
            self.label,
            self.started.elapsed().as_secs_f64()
        ));
    }
}

/// 收集事件，供测试和非交互场景使用
#[derive(Debug, Default)]
pub struct CollectingPresenter {
    pub events: Vec<String>,
    pub finished: bool,
}

impl ProgressPresenter for CollectingPresenter {
    fn show(&mut self, event: &ProgressEvent) {
        self.events.push(event.message.clone());
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}
