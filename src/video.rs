pub(crate) mod display;
pub(crate) mod frame;
pub(crate) mod photo;
pub(crate) mod record;
pub(crate) mod source;
#[cfg(test)]
pub(crate) mod testing;

use std::thread::JoinHandle;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionCommand, SessionController};

/// 管线 bus 上第一条待处理的错误消息 (如果有).
pub(crate) fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.timed_pop_filtered(gst::ClockTime::ZERO, &[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

/// 预览循环: 处理命令, 并按固定周期驱动 controller.
/// 取消、命令通道关闭或收到 `Shutdown` 时退出, 退出前总会调用 `shutdown`.
pub(crate) async fn run_session_loop(
    mut controller: SessionController,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    // 跟不上就跳过, 不补帧
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // 预览停了但还有录像在后台收尾时也要继续轮询, 好把结果报给界面
        let polling = controller.preview_active() || controller.pending_finalizers() > 0;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("session loop cancelled");
                break;
            }
            cmd = commands.recv() => match cmd {
                None | Some(SessionCommand::Shutdown) => break,
                Some(cmd) => controller.handle(cmd),
            },
            _ = ticker.tick(), if polling => {
                controller.tick();
            }
        }
    }

    controller.shutdown();
    tracing::info!("session loop finished");
}

/// 在独立线程上用单线程 runtime 跑 [`run_session_loop`],
/// 所有摄像头读取都在这一条时间线上, 不占用 UI 线程.
pub(crate) fn spawn_session_thread(
    controller: SessionController,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
    period: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("camera-session".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("failed to build session runtime: {e}");
                    let mut controller = controller;
                    controller.shutdown();
                    return;
                }
            };
            runtime.block_on(run_session_loop(controller, commands, cancel, period));
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecordError;
    use crate::session::{SessionEvent, SessionSettings, SessionState};
    use crate::video::frame::Resolution;
    use crate::video::photo::PhotoFormat;
    use crate::video::record::VideoPreset;
    use crate::video::testing::{CountingSink, RawFileWriterFactory, SyntheticCamera};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn controller(
        camera: SyntheticCamera,
        sink: CountingSink,
        dir: &std::path::Path,
    ) -> SessionController {
        controller_with(camera, RawFileWriterFactory::default(), sink, dir)
    }

    fn controller_with(
        camera: SyntheticCamera,
        writers: RawFileWriterFactory,
        sink: CountingSink,
        dir: &std::path::Path,
    ) -> SessionController {
        SessionController::new(
            Box::new(camera),
            Box::new(writers),
            Box::new(sink),
            SessionSettings {
                resolution: Resolution {
                    width: 16,
                    height: 16,
                },
                frame_rate: 30,
                output_dir: dir.to_path_buf(),
                video: VideoPreset::default(),
                photo_format: PhotoFormat::Png,
                photo_warmup: Duration::from_secs(1),
            },
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn loop_delivers_frames_through_transient_failures() {
        let dir = tempdir().unwrap();
        let sink = CountingSink::default();
        let delivered = sink.frames.clone();
        let camera = SyntheticCamera::new("loop-flaky").failing_every(10);
        let stats = camera.stats.clone();
        let ctl = controller(camera, sink, dir.path());
        let state = ctl.watch();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session_loop(
            ctl,
            rx,
            cancel.clone(),
            Duration::from_millis(2),
        ));

        tx.send(SessionCommand::StartPreview).unwrap();
        wait_until(|| stats.failed_reads.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(state.borrow().state, SessionState::PreviewOnly);
        assert!(delivered.load(Ordering::SeqCst) >= 20);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(state.borrow().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn stopping_preview_stops_reads() {
        let dir = tempdir().unwrap();
        let sink = CountingSink::default();
        let camera = SyntheticCamera::new("loop-stop");
        let stats = camera.stats.clone();
        let ctl = controller(camera, sink, dir.path());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session_loop(
            ctl,
            rx,
            CancellationToken::new(),
            Duration::from_millis(2),
        ));

        tx.send(SessionCommand::StartPreview).unwrap();
        wait_until(|| stats.reads.load(Ordering::SeqCst) >= 5).await;
        tx.send(SessionCommand::StopPreview).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let after_stop = stats.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stats.reads.load(Ordering::SeqCst), after_stop);

        tx.send(SessionCommand::Shutdown).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_sender_shuts_down_recording() {
        let dir = tempdir().unwrap();
        let sink = CountingSink::default();
        let delivered = sink.frames.clone();
        let ctl = controller(SyntheticCamera::new("loop-drop"), sink, dir.path());
        let state = ctl.watch();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session_loop(
            ctl,
            rx,
            CancellationToken::new(),
            Duration::from_millis(2),
        ));
        tx.send(SessionCommand::StartRecording).unwrap();
        let mut watch = state.clone();
        wait_until(|| watch.borrow_and_update().state == SessionState::Recording).await;
        let before = delivered.load(Ordering::SeqCst);
        wait_until(|| delivered.load(Ordering::SeqCst) >= before + 2).await;

        drop(tx);
        task.await.unwrap();
        assert_eq!(state.borrow().state, SessionState::Idle);
        let videos = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(videos, 1);
    }

    /// 不再发送任何命令, 等待第一条录像结果.
    async fn next_recording_outcome(
        events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    ) -> SessionEvent {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(e @ (SessionEvent::RecordingSaved { .. } | SessionEvent::Error(_))) => {
                        return e;
                    }
                    Ok(_) => {}
                    Err(e) => panic!("event channel: {e}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("no recording outcome reported")
    }

    async fn record_then_pause_preview(
        writers: RawFileWriterFactory,
        name: &str,
    ) -> SessionEvent {
        let dir = tempdir().unwrap();
        let sink = CountingSink::default();
        let delivered = sink.frames.clone();
        let ctl = controller_with(SyntheticCamera::new(name), writers, sink, dir.path());
        let mut events = ctl.subscribe();
        let mut state = ctl.watch();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session_loop(
            ctl,
            rx,
            CancellationToken::new(),
            Duration::from_millis(2),
        ));
        tx.send(SessionCommand::StartRecording).unwrap();
        wait_until(|| state.borrow_and_update().state == SessionState::Recording).await;
        let before = delivered.load(Ordering::SeqCst);
        wait_until(|| delivered.load(Ordering::SeqCst) >= before + 2).await;

        tx.send(SessionCommand::StopPreview).unwrap();
        let outcome = next_recording_outcome(&mut events).await;

        tx.send(SessionCommand::Shutdown).unwrap();
        task.await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn recording_saved_is_reported_after_preview_pause() {
        let writers = RawFileWriterFactory::default().finishing_after(Duration::from_millis(50));
        let outcome = record_then_pause_preview(writers, "loop-pause-saved").await;
        assert!(
            matches!(outcome, SessionEvent::RecordingSaved { frames, .. } if frames >= 1),
            "{outcome:?}"
        );
    }

    #[tokio::test]
    async fn finalize_failure_is_reported_after_preview_pause() {
        let writers = RawFileWriterFactory::default()
            .finishing_after(Duration::from_millis(50))
            .failing_finish();
        let outcome = record_then_pause_preview(writers, "loop-pause-failed").await;
        let expected = RecordError::Finalize("No space left on device".into()).to_string();
        assert_eq!(outcome, SessionEvent::Error(expected));
    }

    #[test]
    fn session_thread_exits_on_cancel() {
        let dir = tempdir().unwrap();
        let ctl = controller(
            SyntheticCamera::new("thread"),
            CountingSink::default(),
            dir.path(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle =
            spawn_session_thread(ctl, rx, cancel.clone(), Duration::from_millis(5)).unwrap();
        tx.send(SessionCommand::StartPreview).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        handle.join().unwrap();
    }
}
