//! 재시작 가능한 데드라인 타이머
//!
//! 고정 시간 동안 리셋이 없으면 등록된 콜백을 한 번 호출하고,
//! 다음 `reset()`까지 대기한다. 송신측은 리포트 대기 중 마지막 프레임
//! 재전송에, 수신측은 조립 진행이 멈췄는지 감지하는 데 사용한다.
//!
//! 1ms 틱 대신 데드라인까지 sleep 하면서 제어 변경(watch 채널)을
//! 함께 기다린다. `reset`/`stop`/`kill`은 동기 함수라 다른 태스크나
//! 스레드에서 호출해도 된다.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// 만료 콜백
pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 카운트 중 (deadline 도달 시 만료)
    Counting { deadline: Instant },
    /// 정지 또는 만료 후 리셋 대기
    Paused,
    /// 영구 종료
    Killed,
}

/// 데드라인 타이머
pub struct DeadlineTimer {
    duration: Duration,
    callback: Callback,
    phase: Arc<watch::Sender<Phase>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineTimer {
    pub fn new<F>(duration: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (phase, _) = watch::channel(Phase::Paused);
        Self {
            duration,
            callback: Arc::new(callback),
            phase: Arc::new(phase),
            task: Mutex::new(None),
        }
    }

    /// 카운트 태스크 시작 (tokio 런타임 안에서 호출)
    ///
    /// 이미 시작된 타이머는 리셋과 같다.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_none() {
            let rx = self.phase.subscribe();
            *task = Some(tokio::spawn(run(
                self.phase.clone(),
                rx,
                self.callback.clone(),
            )));
        }
        drop(task);
        self.reset();
    }

    /// 경과 시간을 0으로 되돌리고 카운트 재개
    pub fn reset(&self) {
        let deadline = Instant::now() + self.duration;
        self.phase.send_if_modified(|phase| match phase {
            Phase::Killed => false,
            _ => {
                *phase = Phase::Counting { deadline };
                true
            }
        });
    }

    /// 카운트 정지 (태스크는 유지, reset으로 재개)
    pub fn stop(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Phase::Counting { .. } => {
                *phase = Phase::Paused;
                true
            }
            _ => false,
        });
    }

    /// 영구 종료
    pub fn kill(&self) {
        self.phase.send_replace(Phase::Killed);
    }

    pub fn is_counting(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Counting { .. })
    }

    pub fn is_killed(&self) -> bool {
        *self.phase.borrow() == Phase::Killed
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn run(phase_tx: Arc<watch::Sender<Phase>>, mut rx: watch::Receiver<Phase>, callback: Callback) {
    loop {
        let phase = *rx.borrow_and_update();
        match phase {
            Phase::Killed => break,
            Phase::Paused => {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            Phase::Counting { deadline } => {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until(deadline) => {
                        // 만료 직전 reset/stop 되었으면 deadline이 달라 발화하지 않음
                        let expired = phase_tx.send_if_modified(|current| {
                            if *current == phase {
                                *current = Phase::Paused;
                                true
                            } else {
                                false
                            }
                        });
                        if expired {
                            trace!("데드라인 타이머 만료");
                            callback();
                        }
                    }
                }
            }
        }
    }
}
