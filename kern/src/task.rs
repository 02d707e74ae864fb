//! Tasks: named cooperative handlers with priority-ordered queues
//! (component C).
//!
//! Task identity compares by pointer first, falling back to content equality
//! only when the pointers differ. We get this for free by interning names
//! behind `Rc<str>` -- `Rc::ptr_eq` gives the pointer comparison, and `Deref`
//! gives us the string for the fallback.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;

use abi::{FreezerEvent, TaskReturn, TaskState};

use crate::message::Message;
use crate::time::Timestamp;

/// An interned task name.
///
/// Two `TaskName`s naming the same task are usually the same `Rc`, so
/// equality is a pointer compare in the common case; the content compare is
/// there for names that were interned separately (e.g. one from a local
/// registration, one decoded off the wire).
#[derive(Clone, Debug)]
pub struct TaskName(Rc<str>);

impl TaskName {
    pub fn new(name: &str) -> Self {
        TaskName(Rc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for TaskName {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}
impl Eq for TaskName {}

impl core::fmt::Display for TaskName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        TaskName::new(s)
    }
}

/// An opaque handle into whatever power-domain bookkeeping the integrator's
/// [`crate::power::PowerManager`] keeps. The kernel never interprets this
/// value; it just hands it back to the power manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PowerHandle(pub u32);

/// Default busy timeout: 3 minutes, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 3 * 60 * 1000;
/// Amount the busy timeout grows by after each warning.
pub const BUSY_TIMEOUT_WARNING_EXTENSION_MS: u32 = 60 * 1000;

/// A cooperative task.
///
/// The callback is a trait object rather than a function pointer plus an
/// opaque `void *arg`: in Rust the implementor's own fields serve as the
/// `arg`, so there's no separate field to keep in sync with it.
pub struct Task {
    name: TaskName,
    callback: Box<dyn FnMut(&str, &Message) -> TaskReturn>,
    priority: abi::Priority,
    state: TaskState,
    busy_without_traffic_ms: u32,
    busy_timeout_ms: u32,
    msg_queue: VecDeque<Message>,
    timer_msg: Option<Message>,
    power_handle: Option<PowerHandle>,
    freezer: Option<Box<dyn FnMut(FreezerEvent)>>,
    suspended: bool,
    paused: bool,
    deleted: bool,
}

impl Task {
    pub fn new(
        name: &str,
        priority: abi::Priority,
        callback: impl FnMut(&str, &Message) -> TaskReturn + 'static,
    ) -> Self {
        Task {
            name: TaskName::new(name),
            callback: Box::new(callback),
            priority,
            state: TaskState::empty(),
            busy_without_traffic_ms: 0,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            msg_queue: VecDeque::new(),
            timer_msg: None,
            power_handle: None,
            freezer: None,
            suspended: false,
            paused: false,
            deleted: false,
        }
    }

    pub fn with_power_handle(mut self, handle: PowerHandle) -> Self {
        self.power_handle = Some(handle);
        self
    }

    pub fn with_freezer(
        mut self,
        freezer: impl FnMut(FreezerEvent) + 'static,
    ) -> Self {
        self.freezer = Some(Box::new(freezer));
        self
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn priority(&self) -> abi::Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn power_handle(&self) -> Option<PowerHandle> {
        self.power_handle
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
        self.notify_freezer(FreezerEvent::Suspend);
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        self.notify_freezer(FreezerEvent::Resume);
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.notify_freezer(FreezerEvent::Pause);
    }

    pub fn unpause(&mut self) {
        self.paused = false;
        self.notify_freezer(FreezerEvent::Restart);
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn notify_freezer(&mut self, event: FreezerEvent) {
        if let Some(f) = &mut self.freezer {
            f(event);
        }
    }

    /// Disables and drops the single timer message, if any.
    pub fn disable_timer(&mut self) {
        self.timer_msg = None;
    }

    pub fn msg_queue(&self) -> &VecDeque<Message> {
        &self.msg_queue
    }

    pub fn timer_msg(&self) -> Option<&Message> {
        self.timer_msg.as_ref()
    }

    pub(crate) fn msg_queue_mut(&mut self) -> &mut VecDeque<Message> {
        &mut self.msg_queue
    }

    /// Removes and returns the queued message with the largest elapsed time
    /// since its `time_stamp`, i.e. the oldest one -- not necessarily the
    /// one at the front, since remote messages can arrive behind local ones
    /// under clock skew. This is the scheduler's sole delivery-order rule.
    pub(crate) fn pop_oldest_message(&mut self, now: Timestamp) -> Option<Message> {
        let idx = self
            .msg_queue
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| m.time_stamp.elapsed_since(now))
            .map(|(i, _)| i)?;
        self.msg_queue.remove(idx)
    }

    pub(crate) fn timer_msg_mut(&mut self) -> &mut Option<Message> {
        &mut self.timer_msg
    }

    pub(crate) fn state_mut(&mut self) -> &mut TaskState {
        &mut self.state
    }

    pub(crate) fn busy_without_traffic_ms_mut(&mut self) -> &mut u32 {
        &mut self.busy_without_traffic_ms
    }

    pub(crate) fn busy_timeout_ms_mut(&mut self) -> &mut u32 {
        &mut self.busy_timeout_ms
    }

    pub fn busy_without_traffic_ms(&self) -> u32 {
        self.busy_without_traffic_ms
    }

    pub fn busy_timeout_ms(&self) -> u32 {
        self.busy_timeout_ms
    }

    /// Drops every queued (non-timer) message, e.g. on pause or power
    /// give-up. Does not touch the timer message.
    pub(crate) fn drain_msg_queue(&mut self) {
        self.msg_queue.clear();
    }

    /// Invokes the task's callback. Only `sched` calls this, since it alone
    /// owns the rule for which queued message gets delivered next.
    pub(crate) fn invoke(&mut self, msg: &Message) -> TaskReturn {
        (self.callback)(self.name.as_str(), msg)
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("suspended", &self.suspended)
            .field("paused", &self.paused)
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// The task registry: every live task, kept sorted by ascending priority so
/// the head is always the highest-priority live task.
#[derive(Default)]
pub struct TaskList {
    tasks: VecDeque<Task>,
}

impl TaskList {
    pub fn new() -> Self {
        TaskList { tasks: VecDeque::new() }
    }

    /// Inserts `task`, keeping the list sorted by ascending priority. Ties
    /// are broken by insertion order (new arrivals go after existing peers
    /// of equal priority), matching a stable sort.
    pub fn insert(&mut self, task: Task) -> Result<(), abi::Error> {
        if self.find(&task.name).is_some() {
            return Err(abi::Error::DuplicateTask);
        }
        let pos = self
            .tasks
            .iter()
            .position(|t| !t.priority.is_more_important_than(task.priority))
            .unwrap_or(self.tasks.len());
        // `is_more_important_than` is strict, so an equal-priority existing
        // task does not satisfy it either way; `position` above finds the
        // first task that is not strictly more important than the new one,
        // which is exactly where the new task belongs to keep equal
        // priorities in arrival order.
        let pos = self
            .tasks
            .iter()
            .take(pos)
            .position(|t| task.priority.is_more_important_than(t.priority))
            .unwrap_or(pos);
        self.tasks.insert(pos, task);
        debug_assert!(
            self.tasks
                .iter()
                .zip(self.tasks.iter().skip(1))
                .all(|(a, b)| !b.priority.is_more_important_than(a.priority)),
            "task list lost its priority ordering on insert"
        );
        Ok(())
    }

    pub fn find(&self, name: &TaskName) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.name == name)
    }

    pub fn find_mut(&mut self, name: &TaskName) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Checks the invariant that the list is sorted ascending by priority.
    /// Exposed for tests; the scheduler maintains this by construction and
    /// never needs to call it in non-test code.
    pub fn is_sorted_by_priority(&self) -> bool {
        self.tasks
            .iter()
            .zip(self.tasks.iter().skip(1))
            .all(|(a, b)| !b.priority.is_more_important_than(a.priority))
    }

    /// Removes every task marked deleted, dropping each one's queued and
    /// timer messages along with it, and returns how many were reaped.
    pub(crate) fn reap_deleted(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| !t.deleted);
        before - self.tasks.len()
    }

    pub(crate) fn deque_mut(&mut self) -> &mut VecDeque<Task> {
        &mut self.tasks
    }
}
