//! Handle registry: the arena that makes opaque callback contexts safe.
//!
//! Every reactor resource the runtime creates (timer, signal event, DNS
//! query, socket, server, HTTP exchange) is represented by exactly one
//! [`Record`] stored in a generation-tagged arena. The only value that
//! flows through reactor callback slots is a [`HandleId`]; a wakeup that
//! arrives after its record was destroyed finds a bumped generation and is
//! silently dropped instead of touching freed state.
//!
//! The registry also backs the observability counters: the data registry
//! count is the number of live records, and the function registry count is
//! the number of occupied callback slots across all bundles.

use std::cell::RefCell;
use std::rc::Rc;

use crate::condition::Condition;
use crate::dns::Family;
use crate::http::{HttpClientState, HttpRequest, HttpRequestState, HttpServerState};
use crate::signal::SignalState;
use crate::tcp::{Socket, SocketState, TcpServerState};

/// Shared callback invoked with freshly read socket bytes.
pub type ReadCb = Rc<RefCell<dyn FnMut(Socket, Vec<u8>)>>;
/// Shared callback invoked when a socket's write buffer drains.
pub type WriteCb = Rc<RefCell<dyn FnMut(Socket)>>;
/// Shared callback receiving conditions for a handle.
pub type EventCb = Rc<RefCell<dyn FnMut(&Condition)>>;
/// Shared callback invoked with the delivered signal number.
pub type SignalCb = Rc<RefCell<dyn FnMut(i32)>>;
/// Shared callback invoked with each parsed HTTP server request.
pub type RequestCb = Rc<RefCell<dyn FnMut(HttpRequest)>>;
/// One-shot callback receiving a parsed HTTP client response.
pub type ResponseCb = Box<dyn FnOnce(u16, Vec<(String, String)>, Vec<u8>)>;
/// One-shot callback receiving a resolved address.
pub type ResolveCb = Box<dyn FnOnce(&str, Family)>;
/// One-shot callback fired when a timer expires.
pub type TimerCb = Box<dyn FnOnce()>;

/// Wrap a plain closure as a shared event callback.
pub(crate) fn share_event_cb(f: impl FnMut(&Condition) + 'static) -> EventCb {
    Rc::new(RefCell::new(f))
}

/// Wrap a plain closure as a shared read callback.
pub(crate) fn share_read_cb(f: impl FnMut(Socket, Vec<u8>) + 'static) -> ReadCb {
    Rc::new(RefCell::new(f))
}

/// Wrap a plain closure as a shared write callback.
pub(crate) fn share_write_cb(f: impl FnMut(Socket) + 'static) -> WriteCb {
    Rc::new(RefCell::new(f))
}

/// An opaque, generation-tagged reference to a live handle record.
///
/// The index addresses an arena slot; the generation distinguishes the
/// current occupant from any prior one, so a stale id can never resolve to
/// a recycled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    /// The arena slot index, used as the reactor token for this handle.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// What kind of reactor resource a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// The supervisor's own bookkeeping record.
    Loop,
    Timer,
    Signal,
    Dns,
    Socket,
    TcpServer,
    HttpServer,
    HttpClient,
    HttpRequest,
}

/// The callback bundle attached to a handle, one variant per kind.
///
/// One-shot slots (`TimerCb`, `ResolveCb`, `ResponseCb`) are `Option`s that
/// are taken at fire time; shared slots are `Rc`s so a server can seed the
/// sockets it accepts with its own callbacks.
pub enum Bundle {
    Loop {
        default_event: EventCb,
        fatal: EventCb,
    },
    Timer {
        fire: Option<TimerCb>,
        event: Option<EventCb>,
    },
    Signal {
        signal: SignalCb,
        event: Option<EventCb>,
    },
    Dns {
        resolve: Option<ResolveCb>,
        event: Option<EventCb>,
    },
    Socket {
        read: Option<ReadCb>,
        write: Option<WriteCb>,
        event: Option<EventCb>,
    },
    TcpServer {
        read: Option<ReadCb>,
        event: Option<EventCb>,
    },
    HttpServer {
        request: RequestCb,
        event: Option<EventCb>,
    },
    HttpClient {
        response: Option<ResponseCb>,
        event: Option<EventCb>,
    },
    HttpRequest {
        event: Option<EventCb>,
    },
}

impl Bundle {
    /// Number of occupied callback slots, the unit of the function
    /// registry count.
    pub fn slot_count(&self) -> usize {
        fn opt<T>(o: &Option<T>) -> usize {
            usize::from(o.is_some())
        }
        match self {
            Bundle::Loop { .. } => 2,
            Bundle::Timer { fire, event } => opt(fire) + opt(event),
            Bundle::Signal { event, .. } => 1 + opt(event),
            Bundle::Dns { resolve, event } => opt(resolve) + opt(event),
            Bundle::Socket { read, write, event } => opt(read) + opt(write) + opt(event),
            Bundle::TcpServer { read, event } => opt(read) + opt(event),
            Bundle::HttpServer { event, .. } => 1 + opt(event),
            Bundle::HttpClient { response, event } => opt(response) + opt(event),
            Bundle::HttpRequest { event } => opt(event),
        }
    }

    /// The event callback slot, shared by every variant that has one.
    pub fn event_cb(&self) -> Option<EventCb> {
        match self {
            Bundle::Loop { default_event, .. } => Some(default_event.clone()),
            Bundle::Timer { event, .. }
            | Bundle::Signal { event, .. }
            | Bundle::Dns { event, .. }
            | Bundle::Socket { event, .. }
            | Bundle::TcpServer { event, .. }
            | Bundle::HttpServer { event, .. }
            | Bundle::HttpClient { event, .. }
            | Bundle::HttpRequest { event } => event.clone(),
        }
    }
}

/// Kind-specific mutable state carried by a record.
pub enum HandleState {
    Loop,
    Timer,
    Signal(SignalState),
    Dns,
    Socket(SocketState),
    TcpServer(TcpServerState),
    HttpServer(HttpServerState),
    HttpClient(HttpClientState),
    HttpRequest(HttpRequestState),
}

/// One live handle: id, kind tag, callback bundle and kind-specific state.
pub struct Record {
    pub id: HandleId,
    pub kind: HandleKind,
    pub bundle: Bundle,
    pub state: HandleState,
}

struct Slot {
    generation: u32,
    record: Option<Record>,
}

/// Generation-tagged arena of handle records.
///
/// Slots are recycled through a free list; destroying a record bumps the
/// slot generation so outstanding [`HandleId`]s for the old occupant go
/// stale instead of aliasing the new one.
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocations: u64,
    destructions: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocations: 0,
            destructions: 0,
        }
    }

    /// Reserve a slot for a record of the given kind and issue its id.
    ///
    /// The slot is empty until [`attach`](Self::attach) stores the record;
    /// lookups in between behave as if the id were already destroyed.
    pub fn allocate(&mut self, _kind: HandleKind) -> HandleId {
        self.allocations += 1;
        match self.free.pop() {
            Some(index) => HandleId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, record: None });
                HandleId { index, generation: 0 }
            }
        }
    }

    /// Store a record under a previously allocated id.
    pub fn attach(&mut self, id: HandleId, kind: HandleKind, bundle: Bundle, state: HandleState) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert!(slot.record.is_none(), "attach over a live record");
        slot.record = Some(Record { id, kind, bundle, state });
        self.live += 1;
    }

    /// Resolve an id to its live record, or `None` if it was destroyed.
    pub fn lookup(&mut self, id: HandleId) -> Option<&mut Record> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Resolve an arena index (a reactor token) to its live record.
    pub fn lookup_index(&mut self, index: u32) -> Option<&mut Record> {
        self.slots.get_mut(index as usize)?.record.as_mut()
    }

    /// Remove a record, bump the slot generation and recycle the slot.
    ///
    /// Returns the record so the caller can release the reactor resources
    /// it holds. The caller is expected to have quiesced those resources
    /// first so no further wakeups carry this id.
    pub fn destroy(&mut self, id: HandleId) -> Option<Record> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        self.destructions += 1;
        tracing::trace!(index = id.index, kind = ?record.kind, "handle destroyed");
        Some(record)
    }

    /// Remove every record, returning them for resource release. Used by
    /// forced loop teardown.
    pub fn drain(&mut self) -> Vec<Record> {
        let mut drained = Vec::with_capacity(self.live);
        for slot in &mut self.slots {
            if let Some(record) = slot.record.take() {
                slot.generation = slot.generation.wrapping_add(1);
                drained.push(record);
            }
        }
        self.destructions += drained.len() as u64;
        self.live = 0;
        self.free.clear();
        self.free.extend((0..self.slots.len() as u32).rev());
        drained
    }

    /// Iterate over every live record.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.slots.iter().filter_map(|s| s.record.as_ref())
    }

    /// Ids of all live records of one kind.
    pub fn ids_of_kind(&self, kind: HandleKind) -> Vec<HandleId> {
        self.slots
            .iter()
            .filter_map(|s| s.record.as_ref())
            .filter(|r| r.kind == kind)
            .map(|r| r.id)
            .collect()
    }

    /// Number of live records (the data registry count).
    pub fn data_count(&self) -> usize {
        self.live
    }

    /// Number of occupied callback slots (the function registry count).
    pub fn fn_count(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.record.as_ref())
            .map(|r| r.bundle.slot_count())
            .sum()
    }

    /// Cumulative allocations since the registry was created.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Cumulative destructions since the registry was created.
    pub fn destructions(&self) -> u64 {
        self.destructions
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
