use crate::{
    binding_model::{BindGroup, BindGroupLayout, BindGroupMask, PipelineLayout},
    command::draw::DrawError,
};

use smallvec::SmallVec;

use std::sync::Arc;

mod compat {
    use std::ops::Range;

    #[derive(Debug)]
    struct Entry<T> {
        assigned: Option<T>,
        expected: Option<T>,
    }

    impl<T> Default for Entry<T> {
        fn default() -> Self {
            Self {
                assigned: None,
                expected: None,
            }
        }
    }

    impl<T: PartialEq> Entry<T> {
        fn is_active(&self) -> bool {
            self.assigned.is_some() && self.expected.is_some()
        }

        fn is_valid(&self) -> bool {
            self.expected.is_none() || self.expected == self.assigned
        }
    }

    #[derive(Debug)]
    pub struct Manager<T> {
        entries: [Entry<T>; hal::MAX_BIND_GROUPS],
    }

    impl<T: Clone + PartialEq> Manager<T> {
        pub fn new() -> Self {
            Self {
                entries: Default::default(),
            }
        }

        fn make_range(&self, start_index: usize) -> Range<usize> {
            // find first incompatible entry
            let end = self
                .entries
                .iter()
                .position(|e| !e.is_valid())
                .unwrap_or(self.entries.len());
            start_index..end.max(start_index)
        }

        pub fn update_expectations(&mut self, expectations: &[Option<T>]) -> Range<usize> {
            let start_index = self
                .entries
                .iter()
                .zip(expectations)
                .position(|(e, expect)| e.expected != *expect)
                .unwrap_or(expectations.len());
            for (e, expect) in self.entries[start_index..]
                .iter_mut()
                .zip(expectations[start_index..].iter())
            {
                e.expected = expect.clone();
            }
            for e in self.entries[expectations.len()..].iter_mut() {
                e.expected = None;
            }
            self.make_range(start_index)
        }

        pub fn clear_expectations(&mut self) {
            for e in self.entries.iter_mut() {
                e.expected = None;
            }
        }

        pub fn assign(&mut self, index: usize, value: T) -> Range<usize> {
            self.entries[index].assigned = Some(value);
            self.make_range(index)
        }

        pub fn list_active(&self) -> impl Iterator<Item = usize> + '_ {
            self.entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| if e.is_active() { Some(i) } else { None })
        }

        pub fn invalid_mask(&self) -> super::BindGroupMask {
            self.entries.iter().enumerate().fold(0, |mask, (i, entry)| {
                if entry.is_valid() {
                    mask
                } else {
                    mask | 1u8 << i
                }
            })
        }
    }

    #[test]
    fn test_compatibility() {
        let mut man = Manager::<&i32>::new();
        man.entries[0] = Entry {
            expected: Some(&3),
            assigned: Some(&2),
        };
        man.entries[1] = Entry {
            expected: Some(&1),
            assigned: Some(&1),
        };
        man.entries[2] = Entry {
            expected: Some(&4),
            assigned: Some(&5),
        };
        // check that we rebind [1] after [0] became compatible
        assert_eq!(man.assign(0, &3), 0..2);
        // check that nothing is rebound
        assert_eq!(man.update_expectations(&[Some(&3), Some(&2)]), 1..1);
        // check that everything past [0] is rebound on expectations change
        assert_eq!(man.update_expectations(&[Some(&3), Some(&1), Some(&5)]), 1..4);
        // reset the first two bindings
        assert_eq!(man.update_expectations(&[Some(&4), Some(&6), Some(&5)]), 0..0);
        // check that nothing is rebound, even if there is a match,
        // since earlier binding is incompatible.
        assert_eq!(man.assign(1, &6), 1..1);
        // finally, bind everything
        assert_eq!(man.assign(0, &4), 0..4);
        assert_eq!(man.invalid_mask(), 0);
        assert_eq!(man.list_active().collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn unused_slots_are_skipped() {
        let mut man = Manager::<&i32>::new();
        assert_eq!(man.update_expectations(&[Some(&1), None, Some(&2)]), 0..0);
        assert_eq!(man.invalid_mask(), 0b101);
        assert_eq!(man.assign(2, &2), 2..2);
        assert_eq!(man.invalid_mask(), 0b001);
        assert_eq!(man.assign(0, &1), 0..4);
        assert_eq!(man.list_active().collect::<Vec<_>>(), [0, 2]);
        man.clear_expectations();
        assert_eq!(man.list_active().count(), 0);
    }
}

#[derive(Debug)]
pub(crate) struct EntryPayload<A: hal::Api> {
    pub(crate) group: Option<Arc<BindGroup<A>>>,
    pub(crate) dynamic_offsets: SmallVec<[wgt::DynamicOffset; 4]>,
}

impl<A: hal::Api> Default for EntryPayload<A> {
    fn default() -> Self {
        Self {
            group: None,
            dynamic_offsets: SmallVec::new(),
        }
    }
}

/// Tracks the bind groups assigned to each slot, and which of them match
/// the layout of the current pipeline.
#[derive(Debug)]
pub(crate) struct Binder<A: hal::Api> {
    pub(crate) pipeline_layout: Option<Arc<PipelineLayout<A>>>,
    manager: compat::Manager<Arc<BindGroupLayout<A>>>,
    payloads: [EntryPayload<A>; hal::MAX_BIND_GROUPS],
}

impl<A: hal::Api> Binder<A> {
    pub(crate) fn new() -> Self {
        Self {
            pipeline_layout: None,
            manager: compat::Manager::new(),
            payloads: Default::default(),
        }
    }

    /// Forgets the pipeline layout but keeps the assigned groups, so that the
    /// next layout change reports every compatible group for rebinding.
    pub(crate) fn reset_expectations(&mut self) {
        self.pipeline_layout = None;
        self.manager.clear_expectations();
    }

    pub(crate) fn change_pipeline_layout<'a>(
        &'a mut self,
        new: &Arc<PipelineLayout<A>>,
    ) -> (usize, &'a [EntryPayload<A>]) {
        self.pipeline_layout = Some(Arc::clone(new));
        let bind_range = self.manager.update_expectations(&new.bind_group_layouts);
        (bind_range.start, &self.payloads[bind_range])
    }

    pub(crate) fn assign_group<'a>(
        &'a mut self,
        index: usize,
        group: &Arc<BindGroup<A>>,
        offsets: &[wgt::DynamicOffset],
    ) -> (usize, &'a [EntryPayload<A>]) {
        log::trace!("\tBinding [{}] = group {:?}", index, group.info.label());

        let payload = &mut self.payloads[index];
        payload.group = Some(Arc::clone(group));
        payload.dynamic_offsets.clear();
        payload.dynamic_offsets.extend_from_slice(offsets);

        let bind_range = self.manager.assign(index, Arc::clone(&group.layout));
        (bind_range.start, &self.payloads[bind_range])
    }

    /// Groups that are both assigned and expected by the current layout.
    pub(crate) fn list_active(&self) -> impl Iterator<Item = &Arc<BindGroup<A>>> + '_ {
        let payloads = &self.payloads;
        self.manager
            .list_active()
            .filter_map(move |index| payloads[index].group.as_ref())
    }

    pub(crate) fn invalid_mask(&self) -> BindGroupMask {
        self.manager.invalid_mask()
    }

    pub(crate) fn check_compatibility(&self) -> Result<(), DrawError> {
        let mask = self.invalid_mask();
        if mask == 0 {
            return Ok(());
        }
        let index = mask.trailing_zeros();
        if self.payloads[index as usize].group.is_none() {
            Err(DrawError::MissingBindGroup { index })
        } else {
            Err(DrawError::IncompatibleBindGroup { index })
        }
    }
}
