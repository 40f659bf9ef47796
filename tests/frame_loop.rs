// Frame loop behaviour against a scripted backend

use ash::vk;
use std::collections::VecDeque;
use std::time::Duration;
use vk_presenter::{
    AcquireOutcome, EngineError, FrameBackend, FrameStatus, FrameSynchronizer, LoopOptions,
    LoopState, PresentOutcome, RecreateOutcome, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Acquire(usize),
    Submit(usize, u32),
    Present(usize, u32),
    WaitIdle,
    Recreate(u32, u32),
    Release,
}

struct MockBackend {
    frames_in_flight: usize,
    image_count: u32,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    fail_submit: bool,
    fail_recreate: bool,
    /// Outcomes handed out before falling back to `Rebuilt`
    recreate_script: VecDeque<RecreateOutcome>,
    calls: Vec<Call>,
}

impl MockBackend {
    fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight,
            image_count: 3,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            fail_submit: false,
            fail_recreate: false,
            recreate_script: VecDeque::new(),
            calls: Vec::new(),
        }
    }

    fn count(&self, call: Call) -> usize {
        self.calls.iter().filter(|&&c| c == call).count()
    }

    fn has_any(&self, pred: impl Fn(&Call) -> bool) -> bool {
        self.calls.iter().any(pred)
    }
}

impl FrameBackend for MockBackend {
    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.calls.push(Call::Acquire(slot));
        if let Some(outcome) = self.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.calls.push(Call::Submit(slot, image_index));
        if self.fail_submit {
            return Err(EngineError::Presentation {
                stage: "submit",
                result: vk::Result::ERROR_DEVICE_LOST,
            });
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.calls.push(Call::Present(slot, image_index));
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        Ok(())
    }

    fn recreate(&mut self, desired: vk::Extent2D) -> Result<RecreateOutcome> {
        self.calls.push(Call::Recreate(desired.width, desired.height));
        if self.fail_recreate {
            return Err(EngineError::ResourceCreation {
                what: "swapchain",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        let outcome = self
            .recreate_script
            .pop_front()
            .unwrap_or(RecreateOutcome::Rebuilt);
        if outcome == RecreateOutcome::Rebuilt {
            self.next_image = 0;
        }
        Ok(outcome)
    }

    fn release(&mut self) {
        self.calls.push(Call::Release);
    }
}

fn synchronizer(backend: MockBackend) -> FrameSynchronizer<MockBackend> {
    FrameSynchronizer::new(
        backend,
        vk::Extent2D {
            width: 800,
            height: 600,
        },
        LoopOptions {
            idle_poll: Duration::ZERO,
        },
    )
}

fn take_calls(sync: &mut FrameSynchronizer<MockBackend>) -> Vec<Call> {
    std::mem::take(&mut sync.backend_mut().calls)
}

#[test]
fn frames_run_acquire_submit_present_and_cycle_slots() {
    let mut sync = synchronizer(MockBackend::new(2));

    for _ in 0..3 {
        assert!(matches!(sync.step().unwrap(), FrameStatus::Presented { .. }));
    }

    assert_eq!(
        take_calls(&mut sync),
        vec![
            Call::Acquire(0),
            Call::Submit(0, 0),
            Call::Present(0, 0),
            Call::Acquire(1),
            Call::Submit(1, 1),
            Call::Present(1, 1),
            Call::Acquire(0),
            Call::Submit(0, 2),
            Call::Present(0, 2),
        ]
    );
    assert_eq!(sync.frames_presented(), 3);
    assert_eq!(sync.state(), LoopState::Running);
}

#[test]
fn out_of_date_acquire_skips_the_frame_and_recreates_before_the_next() {
    let mut backend = MockBackend::new(2);
    backend.acquire_script.push_back(AcquireOutcome::OutOfDate);
    let mut sync = synchronizer(backend);

    assert_eq!(sync.step().unwrap(), FrameStatus::Skipped);
    assert_eq!(sync.state(), LoopState::Recreating);
    assert_eq!(take_calls(&mut sync), vec![Call::Acquire(0)]);

    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
    assert_eq!(
        take_calls(&mut sync),
        vec![Call::WaitIdle, Call::Recreate(800, 600)]
    );

    // The skipped slot is reused, nothing was submitted from it
    assert_eq!(sync.step().unwrap(), FrameStatus::Presented { image_index: 0 });
    assert_eq!(
        take_calls(&mut sync),
        vec![Call::Acquire(0), Call::Submit(0, 0), Call::Present(0, 0)]
    );
    assert_eq!(sync.recreations(), 1);
    assert_eq!(sync.frames_presented(), 1);
}

#[test]
fn zero_area_resize_idles_without_recreating() {
    let mut sync = synchronizer(MockBackend::new(2));
    sync.on_resize(0, 0);

    for _ in 0..5 {
        assert_eq!(sync.step().unwrap(), FrameStatus::Idle);
    }
    assert_eq!(sync.state(), LoopState::Recreating);
    assert!(sync.backend().calls.is_empty());

    sync.on_resize(1024, 0);
    assert_eq!(sync.step().unwrap(), FrameStatus::Idle);
    assert!(sync.backend().calls.is_empty());

    sync.on_resize(1024, 768);
    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
    assert_eq!(
        take_calls(&mut sync),
        vec![Call::WaitIdle, Call::Recreate(1024, 768)]
    );
    assert_eq!(sync.recreations(), 1);
}

#[test]
fn zero_area_surface_idles_until_it_grows() {
    // The window reports a size, the surface still resolves to 0x0
    let mut backend = MockBackend::new(2);
    backend
        .recreate_script
        .extend([RecreateOutcome::Degenerate, RecreateOutcome::Degenerate]);
    let mut sync = synchronizer(backend);
    sync.on_resize(1024, 768);

    assert_eq!(sync.step().unwrap(), FrameStatus::Idle);
    assert_eq!(sync.step().unwrap(), FrameStatus::Idle);
    assert_eq!(sync.state(), LoopState::Recreating);
    assert_eq!(sync.recreations(), 0);
    assert!(!sync.backend().has_any(|c| matches!(c, Call::Acquire(_))));

    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
    assert_eq!(sync.state(), LoopState::Running);
    assert_eq!(sync.recreations(), 1);
    assert_eq!(sync.backend().count(Call::Recreate(1024, 768)), 3);

    assert_eq!(sync.step().unwrap(), FrameStatus::Presented { image_index: 0 });
}

#[test]
fn zero_area_surface_does_not_end_the_loop() {
    let mut backend = MockBackend::new(2);
    backend.recreate_script.extend([RecreateOutcome::Degenerate; 4]);
    let mut sync = synchronizer(backend);
    sync.on_resize(640, 480);

    let mut iterations = 0;
    sync.run_frame_loop(|| {
        iterations += 1;
        iterations <= 6
    })
    .unwrap();

    // Four idle rebuild attempts, then a real one and a frame
    let backend = sync.backend();
    assert_eq!(backend.count(Call::Recreate(640, 480)), 5);
    assert_eq!(backend.count(Call::Present(0, 0)), 1);
    assert_eq!(backend.calls.last(), Some(&Call::Release));
}

#[test]
fn minimized_loop_keeps_polling_until_stopped() {
    let mut sync = synchronizer(MockBackend::new(2));
    sync.on_resize(0, 0);

    let mut iterations = 0;
    sync.run_frame_loop(|| {
        iterations += 1;
        iterations <= 10
    })
    .unwrap();

    let backend = sync.backend();
    assert!(!backend.has_any(|c| matches!(c, Call::Recreate(..) | Call::Acquire(_))));
    assert_eq!(backend.calls, vec![Call::WaitIdle, Call::Release]);
}

#[test]
fn suboptimal_or_out_of_date_present_recreates_next_iteration() {
    for outcome in [PresentOutcome::Suboptimal, PresentOutcome::OutOfDate] {
        let mut backend = MockBackend::new(2);
        backend.present_script.push_back(outcome);
        let mut sync = synchronizer(backend);

        assert_eq!(sync.step().unwrap(), FrameStatus::Presented { image_index: 0 });
        assert_eq!(sync.state(), LoopState::Recreating, "{:?}", outcome);
        assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);

        let calls = take_calls(&mut sync);
        assert_eq!(
            calls[3..],
            [Call::WaitIdle, Call::Recreate(800, 600)],
            "{:?}",
            outcome
        );
    }
}

#[test]
fn suboptimal_acquire_still_renders_then_recreates() {
    let mut backend = MockBackend::new(2);
    backend.acquire_script.push_back(AcquireOutcome::Acquired {
        image_index: 2,
        suboptimal: true,
    });
    let mut sync = synchronizer(backend);

    assert_eq!(sync.step().unwrap(), FrameStatus::Presented { image_index: 2 });
    assert_eq!(
        take_calls(&mut sync),
        vec![Call::Acquire(0), Call::Submit(0, 2), Call::Present(0, 2)]
    );
    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
}

#[test]
fn resize_while_running_recreates_before_acquiring() {
    let mut sync = synchronizer(MockBackend::new(2));
    sync.step().unwrap();
    take_calls(&mut sync);

    sync.on_resize(1280, 720);
    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
    assert_eq!(
        take_calls(&mut sync),
        vec![Call::WaitIdle, Call::Recreate(1280, 720)]
    );
    assert_eq!(sync.desired_extent().width, 1280);
}

#[test]
fn resize_handle_delivers_the_latest_size() {
    let mut sync = synchronizer(MockBackend::new(2));
    let handle = sync.resize_handle();

    handle.on_resize(640, 480);
    handle.on_resize(1920, 1080);

    assert_eq!(sync.step().unwrap(), FrameStatus::Recreated);
    assert_eq!(sync.backend().count(Call::Recreate(1920, 1080)), 1);
    assert_eq!(sync.backend().count(Call::Recreate(640, 480)), 0);
}

#[test]
fn resize_handle_works_across_threads() {
    let mut sync = synchronizer(MockBackend::new(2));
    let handle = sync.resize_handle();

    std::thread::spawn(move || handle.on_resize(0, 0))
        .join()
        .unwrap();

    assert_eq!(sync.step().unwrap(), FrameStatus::Idle);
    assert_eq!(sync.desired_extent().height, 0);
}

#[test]
fn fatal_submit_error_shuts_down_and_is_returned() {
    let mut backend = MockBackend::new(2);
    backend.fail_submit = true;
    let mut sync = synchronizer(backend);

    let err = sync.run_frame_loop(|| true).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Presentation {
            result: vk::Result::ERROR_DEVICE_LOST,
            ..
        }
    ));

    assert_eq!(sync.state(), LoopState::ShuttingDown);
    assert_eq!(
        take_calls(&mut sync),
        vec![
            Call::Acquire(0),
            Call::Submit(0, 0),
            Call::WaitIdle,
            Call::Release
        ]
    );
    assert_eq!(sync.frames_presented(), 0);
}

#[test]
fn failed_recreation_is_fatal() {
    let mut backend = MockBackend::new(2);
    backend.fail_recreate = true;
    let mut sync = synchronizer(backend);
    sync.on_resize(1024, 768);

    let err = sync.run_frame_loop(|| true).unwrap_err();
    assert!(matches!(err, EngineError::ResourceCreation { .. }));
    assert_eq!(sync.backend().count(Call::Release), 1);
    assert_eq!(sync.recreations(), 0);
}

#[test]
fn shutdown_waits_for_idle_then_releases_once() {
    let mut sync = synchronizer(MockBackend::new(2));

    let mut remaining = 2;
    sync.run_frame_loop(|| {
        remaining -= 1;
        remaining >= 0
    })
    .unwrap();

    let calls = take_calls(&mut sync);
    assert_eq!(calls.len(), 8);
    assert_eq!(calls[6..], [Call::WaitIdle, Call::Release]);

    sync.shutdown();
    assert_eq!(sync.step().unwrap(), FrameStatus::Stopped);
    sync.on_resize(800, 600);
    assert_eq!(sync.state(), LoopState::ShuttingDown);
    assert!(sync.backend().calls.is_empty());
}

#[test]
fn single_frame_in_flight_always_uses_slot_zero() {
    let mut sync = synchronizer(MockBackend::new(1));
    for _ in 0..3 {
        sync.step().unwrap();
    }
    let backend = sync.backend();
    assert_eq!(backend.count(Call::Acquire(0)), 3);
    assert!(!backend.has_any(|c| matches!(c, Call::Acquire(1))));
}
