// Frame pacing - bounded frames in flight
//
// A FIFO queue of completion markers tracks frames whose GPU work has been
// submitted but not confirmed finished. After every present the queue is
// drained down to the configured cap by synchronously waiting on the
// oldest markers, which is what bounds CPU-ahead-of-GPU latency. Retired
// markers go into a reuse pool instead of being recreated each frame.

use std::collections::VecDeque;

use anyhow::Result;

use crate::rhi::{CommandQueue, EventQueryHandle, RenderDevice};

#[derive(Default)]
pub struct InFlightFrames {
    in_flight: VecDeque<EventQueryHandle>,
    retired: Vec<EventQueryHandle>,
}

impl InFlightFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once per present, unconditionally: drains the queue until fewer
    /// than `max_frames_in_flight` frames remain unconfirmed, then arms a
    /// marker (reused from the pool when possible) on the graphics queue
    /// for the frame just submitted.
    ///
    /// Invariant on return: `self.len() <= max_frames_in_flight`.
    pub fn throttle(
        &mut self,
        device: &mut dyn RenderDevice,
        max_frames_in_flight: usize,
    ) -> Result<()> {
        while self.in_flight.len() >= max_frames_in_flight {
            let Some(query) = self.in_flight.pop_front() else {
                break;
            };
            device.wait_event_query(query)?;
            self.retired.push(query);
        }

        let query = match self.retired.pop() {
            Some(query) => query,
            None => device.create_event_query()?,
        };
        device.reset_event_query(query)?;
        device.set_event_query(query, CommandQueue::Graphics)?;
        self.in_flight.push_back(query);

        Ok(())
    }

    /// Frames submitted but not yet confirmed complete.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Forgets all markers. Used during teardown after the device has been
    /// idle-waited; the markers themselves are owned by the render device.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::testing::RecordingDevice;

    #[test]
    fn queue_length_is_bounded_after_every_present() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        for _ in 0..8 {
            frames.throttle(&mut device, 2).unwrap();
            assert!(frames.len() <= 2);
        }
    }

    #[test]
    fn oldest_marker_is_reused_by_the_third_present() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        frames.throttle(&mut device, 2).unwrap();
        frames.throttle(&mut device, 2).unwrap();
        assert_eq!(device.created_queries.len(), 2);
        assert!(device.waited_queries.is_empty());

        let first = device.created_queries[0];
        frames.throttle(&mut device, 2).unwrap();

        // The third present waits on frame 1's marker and re-arms it
        // instead of allocating a third query.
        assert_eq!(device.waited_queries, vec![first]);
        assert_eq!(device.created_queries.len(), 2);
        assert_eq!(device.reset_queries.last(), Some(&first));
        assert_eq!(
            device.armed_queries.last(),
            Some(&(first, CommandQueue::Graphics))
        );
    }

    #[test]
    fn no_new_markers_after_steady_state() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        for _ in 0..20 {
            frames.throttle(&mut device, 3).unwrap();
        }
        assert_eq!(device.created_queries.len(), 3);
    }

    #[test]
    fn markers_retire_in_fifo_order() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        for _ in 0..4 {
            frames.throttle(&mut device, 1).unwrap();
        }
        let created = device.created_queries.clone();
        assert_eq!(created.len(), 1);
        // With a cap of one, every present after the first waits on the
        // previous frame's marker before re-arming it.
        assert_eq!(device.waited_queries, vec![created[0]; 3]);
    }

    #[test]
    fn every_armed_marker_targets_the_graphics_queue() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        for _ in 0..5 {
            frames.throttle(&mut device, 2).unwrap();
        }
        assert!(device
            .armed_queries
            .iter()
            .all(|(_, queue)| *queue == CommandQueue::Graphics));
    }

    #[test]
    fn clear_empties_both_the_queue_and_the_pool() {
        let mut device = RecordingDevice::default();
        let mut frames = InFlightFrames::new();

        frames.throttle(&mut device, 1).unwrap();
        frames.throttle(&mut device, 1).unwrap();
        assert!(!frames.is_empty());

        frames.clear();
        assert!(frames.is_empty());

        // After a clear the pool is gone too, so the next frame allocates.
        frames.throttle(&mut device, 1).unwrap();
        assert_eq!(device.created_queries.len(), 2);
    }
}
