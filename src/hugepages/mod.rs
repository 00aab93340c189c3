pub mod clock;
pub mod filler;
pub mod page_tracker;
pub mod pages;
pub mod region;
pub mod stats;
pub mod stats_tracker;
pub mod tracker_lists;
pub mod vm;

pub(crate) mod bitmap;
pub(crate) mod timeseries;

// Serializes tests that mutate shared fake-clock statics; clock-advancing
// tests take the write lock, the rest read.
#[cfg(test)]
pub(crate) static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::vm::Unback;

    #[derive(Default)]
    struct MockUnbackState {
        calls: Vec<(usize, usize)>,
        unlocked_calls: Vec<(usize, usize)>,
        fail: bool,
    }

    /// Records every unback request, optionally refusing them all. Clones
    /// share state, so tests keep a handle after moving one into a filler
    /// or region.
    #[derive(Clone, Default)]
    pub(crate) struct MockUnback(Rc<RefCell<MockUnbackState>>);

    impl MockUnback {
        pub fn calls(&self) -> Vec<(usize, usize)> {
            self.0.borrow().calls.clone()
        }

        pub fn unlocked_calls(&self) -> Vec<(usize, usize)> {
            self.0.borrow().unlocked_calls.clone()
        }

        pub fn set_fail(&self, fail: bool) {
            self.0.borrow_mut().fail = fail;
        }

        pub fn clear(&self) {
            let mut state = self.0.borrow_mut();
            state.calls.clear();
            state.unlocked_calls.clear();
        }
    }

    impl Unback for MockUnback {
        fn unback(&mut self, addr: *mut u8, len: usize) -> bool {
            let mut state = self.0.borrow_mut();
            if state.fail {
                return false;
            }
            state.calls.push((addr as usize, len));
            true
        }

        fn unback_unlocked(&mut self, addr: *mut u8, len: usize) -> bool {
            self.0
                .borrow_mut()
                .unlocked_calls
                .push((addr as usize, len));
            self.unback(addr, len)
        }
    }
}
