//! Cycle-driven event scheduling.
//!
//! Subsystems register named events once and then schedule firings of those
//! events with a `u64` payload and a tick delay. A scheduled firing can be
//! cancelled by its `(event, payload)` pair. [`Timing::advance`] pops due
//! firings in deadline order and invokes the registered handlers.
//!
//! The service is single-threaded and shared as `Rc<Timing>`; all methods take
//! `&self`. Handlers run outside every internal borrow, so a handler may
//! freely schedule and cancel events, including rescheduling itself.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

/// Handler invoked when a scheduled firing comes due: `(payload, ticks_late)`.
pub type EventHandler = Box<dyn FnMut(u64, i64)>;

/// Handle to a registered event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TimerId(u64);

struct Scheduled {
    id: TimerId,
    deadline: u64,
    event: EventType,
    payload: u64,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on deadline; FIFO among equal deadlines.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RegisteredEvent {
    name: String,
    handler: Rc<RefCell<EventHandler>>,
}

/// The emulator's timing service.
pub struct Timing {
    now: Cell<u64>,
    next_id: Cell<u64>,
    events: RefCell<Vec<RegisteredEvent>>,
    queue: RefCell<BinaryHeap<Scheduled>>,
    keys: RefCell<HashMap<(EventType, u64), TimerId>>,
    cancelled: RefCell<HashSet<TimerId>>,
}

impl Timing {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            next_id: Cell::new(0),
            events: RefCell::new(Vec::new()),
            queue: RefCell::new(BinaryHeap::new()),
            keys: RefCell::new(HashMap::new()),
            cancelled: RefCell::new(HashSet::new()),
        }
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Registers a named event kind and its handler.
    pub fn register_event(&self, name: &str, handler: EventHandler) -> EventType {
        let mut events = self.events.borrow_mut();
        events.push(RegisteredEvent {
            name: name.to_owned(),
            handler: Rc::new(RefCell::new(handler)),
        });
        EventType(events.len() - 1)
    }

    pub fn event_name(&self, event: EventType) -> Option<String> {
        self.events.borrow().get(event.0).map(|e| e.name.clone())
    }

    /// Schedules `event` to fire `delay_ticks` from now, carrying `payload`.
    ///
    /// A still-pending firing with the same `(event, payload)` pair is
    /// replaced.
    pub fn schedule_event(&self, delay_ticks: u64, event: EventType, payload: u64) {
        let id = TimerId(self.next_id.get());
        self.next_id.set(self.next_id.get().wrapping_add(1));

        if let Some(old) = self.keys.borrow_mut().insert((event, payload), id) {
            self.cancelled.borrow_mut().insert(old);
        }

        self.queue.borrow_mut().push(Scheduled {
            id,
            deadline: self.now.get() + delay_ticks,
            event,
            payload,
        });
    }

    /// Cancels the pending firing identified by `(event, payload)`, if any.
    pub fn unschedule_event(&self, event: EventType, payload: u64) {
        if let Some(id) = self.keys.borrow_mut().remove(&(event, payload)) {
            self.cancelled.borrow_mut().insert(id);
        }
    }

    pub fn is_scheduled(&self, event: EventType, payload: u64) -> bool {
        self.keys.borrow().contains_key(&(event, payload))
    }

    /// Advances guest time by `ticks`, firing every due event in deadline
    /// order.
    pub fn advance(&self, ticks: u64) {
        let target = self.now.get() + ticks;

        loop {
            let due = self.pop_due(target);
            let Some((event, payload, deadline)) = due else {
                break;
            };

            self.now.set(deadline);
            let handler = self.events.borrow()[event.0].handler.clone();
            (handler.borrow_mut().as_mut())(payload, (target - deadline) as i64);
        }

        self.now.set(target);
    }

    fn pop_due(&self, target: u64) -> Option<(EventType, u64, u64)> {
        let mut queue = self.queue.borrow_mut();
        let mut cancelled = self.cancelled.borrow_mut();

        loop {
            let top = queue.peek()?;
            if cancelled.remove(&top.id) {
                queue.pop();
                continue;
            }
            if top.deadline > target {
                return None;
            }
            let fired = queue.pop()?;
            // The key may already point at a replacement firing.
            let mut keys = self.keys.borrow_mut();
            if keys.get(&(fired.event, fired.payload)) == Some(&fired.id) {
                keys.remove(&(fired.event, fired.payload));
            }
            return Some((fired.event, fired.payload, fired.deadline));
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}
