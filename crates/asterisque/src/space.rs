//! Per-session pipe registry.
//!
//! Pipe ids carry their allocator in the high bit: the primary peer sets
//! bit 15, the secondary leaves it clear. The two peers therefore draw
//! from disjoint halves of the id space and never collide without any
//! coordination on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use asterisque_core::{Error, CONTROL_PIPE_ID, PIPE_ID_PRIMARY_MASK};

use crate::pipe::{Pipe, PipeContext};

/// Outcome of the server-side admission path.
pub(crate) enum Admission {
    Created(Arc<Pipe>),
    /// The id is already live; the dispatcher answers with a Close.
    Duplicate,
}

struct SpaceState {
    pipes: HashMap<u16, Arc<Pipe>>,
    /// Low 15 bits of the next allocation candidate.
    next: u16,
}

pub struct PipeSpace {
    primary: bool,
    state: Mutex<SpaceState>,
}

impl PipeSpace {
    pub(crate) fn new(primary: bool) -> Arc<PipeSpace> {
        Arc::new(PipeSpace {
            primary,
            state: Mutex::new(SpaceState {
                pipes: HashMap::new(),
                next: 0,
            }),
        })
    }

    /// Allocate a fresh id in this peer's half and register a new pipe
    /// under it. Scans with wrap-around; a full half is
    /// `ResourceExhausted`.
    pub(crate) fn allocate(
        &self,
        function_id: u16,
        priority: i8,
        ctx: &PipeContext,
    ) -> Result<Arc<Pipe>, Error> {
        let half = if self.primary { PIPE_ID_PRIMARY_MASK } else { 0 };
        let mut state = self.state.lock();
        for offset in 0..=0x7FFF_u16 {
            let low = state.next.wrapping_add(offset) & 0x7FFF;
            let id = half | low;
            if id == CONTROL_PIPE_ID {
                continue;
            }
            if state.pipes.contains_key(&id) {
                continue;
            }
            state.next = low.wrapping_add(1) & 0x7FFF;
            let pipe = Pipe::new(id, function_id, priority, ctx);
            state.pipes.insert(id, pipe.clone());
            return Ok(pipe);
        }
        Err(Error::ResourceExhausted(
            "pipe id space exhausted".to_string(),
        ))
    }

    /// Server-side admission of a peer-allocated id carried by an Open.
    /// Ids from our own half or the reserved id 0 are protocol
    /// violations; a live id is reported as [`Admission::Duplicate`].
    pub(crate) fn admit(
        &self,
        pipe_id: u16,
        function_id: u16,
        priority: i8,
        ctx: &PipeContext,
    ) -> Result<Admission, Error> {
        if pipe_id == CONTROL_PIPE_ID {
            return Err(Error::Protocol("Open on the reserved pipe id 0".to_string()));
        }
        let from_primary_half = pipe_id & PIPE_ID_PRIMARY_MASK != 0;
        if from_primary_half == self.primary {
            return Err(Error::Protocol(format!(
                "peer opened pipe {:#06X} from our own id half",
                pipe_id
            )));
        }
        let mut state = self.state.lock();
        if state.pipes.contains_key(&pipe_id) {
            return Ok(Admission::Duplicate);
        }
        let pipe = Pipe::new(pipe_id, function_id, priority, ctx);
        state.pipes.insert(pipe_id, pipe.clone());
        Ok(Admission::Created(pipe))
    }

    pub(crate) fn get(&self, pipe_id: u16) -> Option<Arc<Pipe>> {
        self.state.lock().pipes.get(&pipe_id).cloned()
    }

    /// Remove an entry once its close has been handled locally.
    pub(crate) fn destroy(&self, pipe_id: u16) -> Option<Arc<Pipe>> {
        self.state.lock().pipes.remove(&pipe_id)
    }

    /// Remove and return every live pipe, for session teardown.
    pub(crate) fn drain(&self) -> Vec<Arc<Pipe>> {
        let mut state = self.state.lock();
        state.pipes.drain().map(|(_, pipe)| pipe).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pipes.is_empty()
    }
}
