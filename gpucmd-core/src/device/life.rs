use crate::{
    command::CommandStream,
    resource::{Buffer, BufferMapCallback},
    SubmissionIndex,
};

use hal::Device as _;

use std::{collections::VecDeque, ops::Range, sync::Weak};

/// A FIFO of items tagged with the submission serial they wait on.
///
/// Serials are enqueued in non-decreasing order. Items sharing a serial are
/// grouped under one entry.
#[derive(Debug)]
pub struct SerialQueue<T> {
    entries: VecDeque<(SubmissionIndex, Vec<T>)>,
}

impl<T> Default for SerialQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> SerialQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, serial: SubmissionIndex, item: T) {
        debug_assert!(
            self.last_serial().map_or(true, |last| last <= serial),
            "Serial {} enqueued after {:?}",
            serial,
            self.last_serial()
        );
        match self.entries.back_mut() {
            Some(&mut (last, ref mut items)) if last == serial => items.push(item),
            _ => self.entries.push_back((serial, vec![item])),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubmissionIndex, &T)> + '_ {
        self.entries
            .iter()
            .flat_map(|&(serial, ref items)| items.iter().map(move |item| (serial, item)))
    }

    /// Items whose serial is at most `serial`.
    pub fn iter_up_to(&self, serial: SubmissionIndex) -> impl Iterator<Item = &T> + '_ {
        self.entries
            .iter()
            .take_while(move |&&(s, _)| s <= serial)
            .flat_map(|&(_, ref items)| items.iter())
    }

    /// Removes and returns the items whose serial is at most `serial`, oldest first.
    pub fn drain_up_to(&mut self, serial: SubmissionIndex) -> Vec<T> {
        let count = self
            .entries
            .iter()
            .position(|&(s, _)| s > serial)
            .unwrap_or_else(|| self.entries.len());
        self.entries
            .drain(..count)
            .flat_map(|(_, items)| items)
            .collect()
    }

    pub fn clear_up_to(&mut self, serial: SubmissionIndex) {
        while let Some(&(s, _)) = self.entries.front() {
            if s > serial {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn first_serial(&self) -> Option<SubmissionIndex> {
        self.entries.front().map(|&(serial, _)| serial)
    }

    pub fn last_serial(&self) -> Option<SubmissionIndex> {
        self.entries.back().map(|&(serial, _)| serial)
    }

    /// Number of items, over all serials.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|&(_, ref items)| items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A map read waiting for the GPU to be done with a submission.
pub(crate) struct PendingMapping<A: hal::Api> {
    pub buffer: Weak<Buffer<A>>,
    pub range: Range<wgt::BufferAddress>,
    pub callback: BufferMapCallback,
}

impl<A: hal::Api> std::fmt::Debug for PendingMapping<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMapping")
            .field("range", &self.range)
            .finish()
    }
}

/// Work submitted to the queue, kept alive until its serial completes.
#[derive(Debug)]
pub(crate) struct ActiveSubmission<A: hal::Api> {
    pub raw: Vec<A::CommandBuffer>,
    /// Hold the references recorded by the command buffers.
    pub streams: Vec<CommandStream<A>>,
}

/// A struct responsible for tracking the lifetime of submitted work.
#[derive(Debug)]
pub(crate) struct LifetimeTracker<A: hal::Api> {
    active: SerialQueue<ActiveSubmission<A>>,
}

impl<A: hal::Api> LifetimeTracker<A> {
    pub fn new() -> Self {
        Self {
            active: SerialQueue::new(),
        }
    }

    pub fn track_submission(&mut self, index: SubmissionIndex, submission: ActiveSubmission<A>) {
        log::trace!(
            "Tracking submission {} with {} command buffers",
            index,
            submission.raw.len()
        );
        self.active.enqueue(index, submission);
    }

    /// Retires the submissions up to `last_done`, destroying their raw command buffers.
    pub fn triage_submissions(&mut self, device: &A::Device, last_done: SubmissionIndex) {
        profiling::scope!("triage_submissions");
        let done = self.active.drain_up_to(last_done);
        if !done.is_empty() {
            log::trace!("{} active submissions up to {} are done", done.len(), last_done);
        }
        for submission in done {
            for raw in submission.raw {
                unsafe { device.destroy_command_buffer(raw) };
            }
        }
    }

    /// Destroys everything, done or not. The caller makes sure the GPU is idle.
    pub fn cleanup(&mut self, device: &A::Device) {
        self.triage_submissions(device, SubmissionIndex::MAX);
    }

    pub fn active_submission_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::SerialQueue;

    #[test]
    fn items_are_grouped_by_serial() {
        let mut queue = SerialQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.first_serial(), None);

        queue.enqueue(1, "a");
        queue.enqueue(1, "b");
        queue.enqueue(3, "c");
        queue.enqueue(4, "d");
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.first_serial(), Some(1));
        assert_eq!(queue.last_serial(), Some(4));
        assert_eq!(
            queue.iter().collect::<Vec<_>>(),
            vec![(1, &"a"), (1, &"b"), (3, &"c"), (4, &"d")]
        );
        assert_eq!(queue.iter_up_to(3).count(), 3);
        assert_eq!(queue.iter_up_to(0).count(), 0);
    }

    #[test]
    fn drain_keeps_later_serials() {
        let mut queue = SerialQueue::new();
        for serial in 0..6u64 {
            queue.enqueue(serial, serial * 10);
        }
        assert_eq!(queue.drain_up_to(2), vec![0, 10, 20]);
        assert_eq!(queue.first_serial(), Some(3));
        assert!(queue.drain_up_to(2).is_empty());

        queue.clear_up_to(4);
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![(5, &50)]);
        queue.clear_up_to(u64::MAX);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
