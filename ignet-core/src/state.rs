//! Connection states shared by the reactor and every protocol built on it.

/// What the reactor should do next with a connection. Protocol callbacks return
/// one of these; the reactor arms the matching watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextState {
    Connect,
    SendDNSQuery,
    ReadDNSReply,
    /// Output is staged; after it is flushed, wait for the next line.
    SendReply,
    /// Output is staged; after it is flushed, ask the protocol for more.
    SendMore,
    ReadMessage,
    ReadMore,
    /// Receive a blob chunk from the peer into the context's file.
    ReadFile,
    /// Stream a blob chunk from the context's file to the peer.
    SendFile,
    ReadPayload,
    /// Parked while a job on the database loop works on the session's behalf.
    DBQuery,
    TerminateConnection,
    /// Tear down without any graceful protocol shutdown.
    Abort,
}

impl NextState {
    /// Terminate and Abort both lead to teardown.
    pub fn is_terminal(self) -> bool {
        matches!(self, NextState::TerminateConnection | NextState::Abort)
    }

    pub fn is_send(self) -> bool {
        matches!(self, NextState::SendReply | NextState::SendMore)
    }

    /// States in which inbound lines are extracted and handed to `read_done`.
    pub fn expects_line(self) -> bool {
        matches!(self, NextState::ReadMessage | NextState::ReadMore)
    }

    /// Blob states use the longer transfer timeout.
    pub fn is_blob(self) -> bool {
        matches!(
            self,
            NextState::ReadFile | NextState::SendFile | NextState::ReadPayload
        )
    }
}

/// Outcome of one attempt to extract a unit from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// A unit was extracted and more bytes remain buffered.
    BufferNotEmpty,
    /// Nothing complete is buffered; go back to the socket.
    MustReadMore,
    /// A unit was extracted and the buffer is drained.
    ReadSuccess,
    /// The buffered data cannot be parsed, or the state does not read lines.
    ReadFail,
}

impl ReadState {
    /// True when a unit was extracted and should be handed to the protocol.
    pub fn has_unit(self) -> bool {
        matches!(self, ReadState::BufferNotEmpty | ReadState::ReadSuccess)
    }
}
