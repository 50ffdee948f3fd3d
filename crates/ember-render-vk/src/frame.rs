// SPDX-License-Identifier: CEPL-1.0
//! The per-frame protocol, independent of the Vulkan calls behind it.
//!
//! One frame on slot `s`:
//! 1. wait for `s`'s in-flight fence
//! 2. acquire a swapchain image (out-of-date: recreate, abort the frame)
//! 3. reset the fence, now that the frame will certainly be submitted
//! 4. re-record `s`'s command buffer for the acquired image
//! 5. submit (waits image-available, signals render-finished and the fence)
//! 6. present (out-of-date: recreate)
//! 7. advance the cursor modulo N
//!
//! Resetting the fence after a successful acquire rather than before it
//! keeps an aborted frame from leaving an unsignaled fence that no
//! submission will ever signal.

use tracing::debug;

use crate::error::VkResult;
use crate::ring::FRAMES_IN_FLIGHT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32, suboptimal: bool },
    /// Acquire found the chain stale. It was rebuilt and nothing was drawn.
    AcquireOutOfDate,
    /// Drawn and submitted, then present found the chain stale. It was rebuilt.
    PresentOutOfDate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotPhase {
    #[default]
    Idle,
    Recording,
    Submitted,
}

/// The GPU-facing half of a frame. `slot` is always `< N` of the scheduler
/// driving it.
pub trait FrameBackend {
    /// Blocks until the slot's last submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> VkResult<()>;
    fn acquire_image(&mut self, slot: usize) -> VkResult<AcquireOutcome>;
    fn reset_slot_fence(&mut self, slot: usize) -> VkResult<()>;
    fn record_commands(&mut self, slot: usize, image_index: u32) -> VkResult<()>;
    fn submit(&mut self, slot: usize) -> VkResult<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> VkResult<PresentOutcome>;
    /// Device idle, then rebuild the chain for the current surface.
    fn recreate_swapchain(&mut self) -> VkResult<()>;
    fn wait_device_idle(&mut self) -> VkResult<()>;
}

/// Ring cursor and per-slot bookkeeping.
#[derive(Debug)]
pub struct FrameScheduler<const N: usize = FRAMES_IN_FLIGHT> {
    current: usize,
    phases: [SlotPhase; N],
    frames_submitted: u64,
    recreations: u64,
    suboptimal_noted: bool,
}

impl<const N: usize> Default for FrameScheduler<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FrameScheduler<N> {
    pub fn new() -> Self {
        assert!(N > 0, "frame ring needs at least one slot");
        Self {
            current: 0,
            phases: [SlotPhase::Idle; N],
            frames_submitted: 0,
            recreations: 0,
            suboptimal_noted: false,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn phase(&self, slot: usize) -> SlotPhase {
        self.phases[slot]
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn run_frame<B: FrameBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> VkResult<FrameOutcome> {
        let slot = self.current;

        backend.wait_for_slot(slot)?;
        self.phases[slot] = SlotPhase::Idle;

        let (image_index, acquire_suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                debug!("frame: swapchain out of date at acquire (slot {slot})");
                self.recreate(backend)?;
                return Ok(FrameOutcome::AcquireOutOfDate);
            }
        };
        self.note_suboptimal(acquire_suboptimal);

        backend.reset_slot_fence(slot)?;
        self.phases[slot] = SlotPhase::Recording;
        backend.record_commands(slot, image_index)?;
        backend.submit(slot)?;
        self.phases[slot] = SlotPhase::Submitted;
        self.frames_submitted += 1;
        self.current = (slot + 1) % N;

        match backend.present(slot, image_index)? {
            PresentOutcome::Presented { suboptimal } => {
                self.note_suboptimal(suboptimal);
                Ok(FrameOutcome::Presented {
                    image_index,
                    suboptimal: acquire_suboptimal || suboptimal,
                })
            }
            PresentOutcome::OutOfDate => {
                debug!("frame: swapchain out of date at present (image {image_index})");
                self.recreate(backend)?;
                Ok(FrameOutcome::PresentOutOfDate)
            }
        }
    }

    /// Rebuilds the chain outside the normal out-of-date path (resize, vsync change).
    pub fn recreate<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> VkResult<()> {
        backend.recreate_swapchain()?;
        self.recreations += 1;
        self.suboptimal_noted = false;
        // Recreate drains the device.
        self.phases = [SlotPhase::Idle; N];
        Ok(())
    }

    /// Waits until nothing is in flight. Must precede any teardown.
    pub fn drain<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> VkResult<()> {
        backend.wait_device_idle()?;
        self.phases = [SlotPhase::Idle; N];
        Ok(())
    }

    fn note_suboptimal(&mut self, suboptimal: bool) {
        if suboptimal && !self.suboptimal_noted {
            debug!("frame: swapchain is suboptimal for the surface; keeping it until it goes out of date");
            self.suboptimal_noted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VkError;
    use ash::vk;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate,
        Idle,
    }

    /// Fences are modelled as "signaled" flags; the GPU finishes a slot's
    /// work exactly when the CPU waits on it.
    struct MockGpu<const N: usize> {
        fence_signaled: [bool; N],
        gpu_busy: [bool; N],
        images: u32,
        next_image: u32,
        acquires: usize,
        presents: usize,
        acquire_out_of_date_on: Vec<usize>,
        present_out_of_date_on: Vec<usize>,
        suboptimal_acquire_on: Vec<usize>,
        acquire_error_on: Option<usize>,
        blocking_waits: usize,
        events: Vec<Event>,
    }

    impl<const N: usize> MockGpu<N> {
        fn new(images: u32) -> Self {
            Self {
                fence_signaled: [true; N],
                gpu_busy: [false; N],
                images,
                next_image: 0,
                acquires: 0,
                presents: 0,
                acquire_out_of_date_on: Vec::new(),
                present_out_of_date_on: Vec::new(),
                suboptimal_acquire_on: Vec::new(),
                acquire_error_on: None,
                blocking_waits: 0,
                events: Vec::new(),
            }
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events.iter().filter(|e| pred(*e)).count()
        }

        fn recorded_slots(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Record(s, _) => Some(*s),
                    _ => None,
                })
                .collect()
        }
    }

    impl<const N: usize> FrameBackend for MockGpu<N> {
        fn wait_for_slot(&mut self, slot: usize) -> VkResult<()> {
            self.events.push(Event::Wait(slot));
            if !self.fence_signaled[slot] {
                assert!(self.gpu_busy[slot], "waiting on a fence nothing will signal");
                self.blocking_waits += 1;
                self.gpu_busy[slot] = false;
                self.fence_signaled[slot] = true;
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> VkResult<AcquireOutcome> {
            self.events.push(Event::Acquire(slot));
            self.acquires += 1;
            let n = self.acquires;
            if self.acquire_error_on == Some(n) {
                return Err(VkError::SwapchainAcquire(vk::Result::ERROR_DEVICE_LOST));
            }
            if self.acquire_out_of_date_on.contains(&n) {
                return Ok(AcquireOutcome::OutOfDate);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images;
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal: self.suboptimal_acquire_on.contains(&n),
            })
        }

        fn reset_slot_fence(&mut self, slot: usize) -> VkResult<()> {
            self.events.push(Event::Reset(slot));
            assert!(self.fence_signaled[slot], "resetting a fence still in use");
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn record_commands(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
            self.events.push(Event::Record(slot, image_index));
            assert!(!self.gpu_busy[slot], "re-recording a command buffer the GPU still reads");
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> VkResult<()> {
            self.events.push(Event::Submit(slot));
            assert!(!self.fence_signaled[slot], "submitting with a signaled fence");
            self.gpu_busy[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> VkResult<PresentOutcome> {
            self.events.push(Event::Present(slot, image_index));
            self.presents += 1;
            if self.present_out_of_date_on.contains(&self.presents) {
                return Ok(PresentOutcome::OutOfDate);
            }
            Ok(PresentOutcome::Presented { suboptimal: false })
        }

        fn recreate_swapchain(&mut self) -> VkResult<()> {
            self.events.push(Event::Recreate);
            self.wait_device_idle()
        }

        fn wait_device_idle(&mut self) -> VkResult<()> {
            self.events.push(Event::Idle);
            for slot in 0..N {
                if self.gpu_busy[slot] {
                    self.gpu_busy[slot] = false;
                    self.fence_signaled[slot] = true;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn frame_k_uses_slot_k_mod_n() {
        let mut gpu = MockGpu::<2>::new(3);
        let mut sched: FrameScheduler<2> = FrameScheduler::new();
        for k in 0..6 {
            assert_eq!(sched.current_slot(), k % 2);
            sched.run_frame(&mut gpu).unwrap();
        }
        assert_eq!(gpu.recorded_slots(), vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(sched.frames_submitted(), 6);

        let mut gpu = MockGpu::<3>::new(3);
        let mut sched: FrameScheduler<3> = FrameScheduler::new();
        for _ in 0..7 {
            sched.run_frame(&mut gpu).unwrap();
        }
        assert_eq!(gpu.recorded_slots(), vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_reuse_waits_for_previous_submission() {
        let mut gpu = MockGpu::<2>::new(3);
        let mut sched: FrameScheduler = FrameScheduler::new();
        sched.run_frame(&mut gpu).unwrap();
        sched.run_frame(&mut gpu).unwrap();
        assert_eq!(sched.phase(0), SlotPhase::Submitted);
        assert_eq!(sched.phase(1), SlotPhase::Submitted);
        // First two waits hit fences created signaled.
        assert_eq!(gpu.blocking_waits, 0);

        sched.run_frame(&mut gpu).unwrap();
        assert_eq!(gpu.blocking_waits, 1);
        assert_eq!(
            &gpu.events[gpu.events.len() - 6..],
            &[
                Event::Wait(0),
                Event::Acquire(0),
                Event::Reset(0),
                Event::Record(0, 2),
                Event::Submit(0),
                Event::Present(0, 2),
            ]
        );
    }

    #[test]
    fn out_of_date_on_frame_7_recreates_once_and_skips_draw() {
        let mut gpu = MockGpu::<2>::new(3);
        gpu.acquire_out_of_date_on = vec![7];
        let mut sched: FrameScheduler = FrameScheduler::new();

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            outcomes.push(sched.run_frame(&mut gpu).unwrap());
        }

        assert_eq!(outcomes[6], FrameOutcome::AcquireOutOfDate);
        assert_eq!(gpu.count(|e| *e == Event::Recreate), 1);
        assert_eq!(sched.recreations(), 1);
        assert_eq!(gpu.count(|e| matches!(e, Event::Record(..))), 9);
        assert_eq!(gpu.count(|e| matches!(e, Event::Submit(_))), 9);
        assert_eq!(gpu.count(|e| matches!(e, Event::Present(..))), 9);
        // The aborted frame neither reset its fence nor moved the cursor.
        assert_eq!(gpu.count(|e| matches!(e, Event::Reset(_))), 9);
        assert_eq!(gpu.recorded_slots(), vec![0, 1, 0, 1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn repeated_out_of_date_never_deadlocks() {
        let mut gpu = MockGpu::<2>::new(2);
        gpu.acquire_out_of_date_on = vec![1, 2, 3, 5];
        let mut sched: FrameScheduler = FrameScheduler::new();
        for _ in 0..8 {
            sched.run_frame(&mut gpu).unwrap();
        }
        assert_eq!(sched.recreations(), 4);
        assert_eq!(sched.frames_submitted(), 4);
    }

    #[test]
    fn present_out_of_date_recreates_after_submit() {
        let mut gpu = MockGpu::<2>::new(3);
        gpu.present_out_of_date_on = vec![2];
        let mut sched: FrameScheduler = FrameScheduler::new();

        assert!(matches!(sched.run_frame(&mut gpu).unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(sched.run_frame(&mut gpu).unwrap(), FrameOutcome::PresentOutOfDate);
        assert_eq!(sched.recreations(), 1);
        assert_eq!(sched.frames_submitted(), 2);
        assert_eq!(sched.current_slot(), 0);
        assert_eq!(sched.phase(1), SlotPhase::Idle);
    }

    #[test]
    fn suboptimal_is_tolerated() {
        let mut gpu = MockGpu::<2>::new(3);
        gpu.suboptimal_acquire_on = vec![1, 2];
        let mut sched: FrameScheduler = FrameScheduler::new();

        assert_eq!(
            sched.run_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented {
                image_index: 0,
                suboptimal: true
            }
        );
        sched.run_frame(&mut gpu).unwrap();
        assert_eq!(sched.recreations(), 0);
        assert_eq!(gpu.count(|e| matches!(e, Event::Present(..))), 2);
    }

    #[test]
    fn fatal_acquire_error_propagates() {
        let mut gpu = MockGpu::<2>::new(3);
        gpu.acquire_error_on = Some(2);
        let mut sched: FrameScheduler = FrameScheduler::new();
        sched.run_frame(&mut gpu).unwrap();
        let err = sched.run_frame(&mut gpu).unwrap_err();
        assert!(matches!(err, VkError::SwapchainAcquire(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(gpu.count(|e| *e == Event::Recreate), 0);
    }

    #[test]
    fn drain_idles_every_slot() {
        let mut gpu = MockGpu::<2>::new(3);
        let mut sched: FrameScheduler = FrameScheduler::new();
        sched.run_frame(&mut gpu).unwrap();
        sched.run_frame(&mut gpu).unwrap();
        sched.drain(&mut gpu).unwrap();
        assert_eq!(sched.phase(0), SlotPhase::Idle);
        assert_eq!(sched.phase(1), SlotPhase::Idle);
        assert!(gpu.gpu_busy.iter().all(|b| !b));
    }
}
