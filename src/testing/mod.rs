use crate::{interconn::MemoryManager, msg, CoreId};
use parking_lot::Mutex;

static LOGGER: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        env_logger::builder().is_test(true).init();
    });
}

/// An outbound message, `receiver` is `None` for broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub receiver: Option<CoreId>,
    pub msg: msg::Message,
}

/// Memory manager recording everything a policy sends.
#[derive(Debug)]
pub struct Recorder {
    block_size: usize,
    sent: Mutex<Vec<Sent>>,
}

impl Recorder {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drains the recorded messages.
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drains the recorded messages as `(kind, receiver)` pairs.
    pub fn take_kinds(&self) -> Vec<(msg::Kind, Option<CoreId>)> {
        self.take()
            .into_iter()
            .map(|sent| (sent.msg.kind, sent.receiver))
            .collect()
    }
}

impl MemoryManager for Recorder {
    fn send(&self, msg: msg::Message, receiver: CoreId) {
        self.sent.lock().push(Sent {
            receiver: Some(receiver),
            msg,
        });
    }

    fn broadcast(&self, msg: msg::Message) {
        self.sent.lock().push(Sent {
            receiver: None,
            msg,
        });
    }

    fn cache_block_size(&self) -> usize {
        self.block_size
    }
}
