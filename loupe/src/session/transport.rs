//! Connection between the controller and a live capture agent.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::debug;
use std::time::Duration;

use crate::domain::TransportError;
use loupe_common::{AgentCommand, AgentEvent, AgentMessage};

/// Callback receiving every message the agent sends.
///
/// Dropped when the connection ends; that is how the controller notices a lost agent.
pub type DispatchFn = Box<dyn Fn(AgentMessage) + Send + Sync>;

/// Outbound commands and inbound dispatch of an agent connection.
pub trait AgentTransport {
    /// # Errors
    /// Returns [`TransportError::Disconnected`] once the agent is gone
    fn send(&self, command: AgentCommand) -> Result<(), TransportError>;

    /// Install the inbound handler; replaces any previous one.
    fn set_dispatch(&mut self, dispatch: DispatchFn);
}

/// In-process transport backed by crossbeam channels.
///
/// A forwarder thread hands agent messages to the installed dispatch function and
/// exits when the [`AgentEndpoint`] is dropped.
pub struct ChannelTransport {
    commands: Sender<AgentCommand>,
    dispatch: Sender<DispatchFn>,
}

impl ChannelTransport {
    /// Create a connected transport/agent pair.
    #[must_use]
    pub fn pair() -> (Self, AgentEndpoint) {
        let (command_tx, command_rx) = unbounded();
        let (message_tx, message_rx) = unbounded::<AgentMessage>();
        let (dispatch_tx, dispatch_rx) = unbounded::<DispatchFn>();

        std::thread::spawn(move || forward(&message_rx, &dispatch_rx));

        (
            Self { commands: command_tx, dispatch: dispatch_tx },
            AgentEndpoint { commands: command_rx, messages: message_tx },
        )
    }
}

fn forward(messages: &Receiver<AgentMessage>, dispatch: &Receiver<DispatchFn>) {
    // Messages arriving before a handler is installed wait in the channel
    let Ok(mut handler) = dispatch.recv() else {
        return;
    };
    while let Ok(message) = messages.recv() {
        while let Ok(replacement) = dispatch.try_recv() {
            handler = replacement;
        }
        handler(message);
    }
    debug!("Agent connection closed");
}

impl AgentTransport for ChannelTransport {
    fn send(&self, command: AgentCommand) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| TransportError::Disconnected)
    }

    fn set_dispatch(&mut self, dispatch: DispatchFn) {
        // The forwarder is gone if the agent already disconnected
        let _ = self.dispatch.send(dispatch);
    }
}

/// Agent side of a [`ChannelTransport`].
pub struct AgentEndpoint {
    commands: Receiver<AgentCommand>,
    messages: Sender<AgentMessage>,
}

impl AgentEndpoint {
    /// Block until the next command arrives; `None` once the client is gone.
    #[must_use]
    pub fn recv_command(&self) -> Option<AgentCommand> {
        self.commands.recv().ok()
    }

    #[must_use]
    pub fn recv_command_timeout(&self, timeout: Duration) -> Option<AgentCommand> {
        match self.commands.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    #[must_use]
    pub fn try_recv_command(&self) -> Option<AgentCommand> {
        match self.commands.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// All commands received so far
    #[must_use]
    pub fn drain_commands(&self) -> Vec<AgentCommand> {
        self.commands.try_iter().collect()
    }

    /// # Errors
    /// Returns [`TransportError::Disconnected`] if the client dropped its transport
    pub fn send(&self, session_id: u64, event: AgentEvent) -> Result<(), TransportError> {
        self.messages
            .send(AgentMessage { session_id, event })
            .map_err(|_| TransportError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_reach_the_agent() {
        let (transport, agent) = ChannelTransport::pair();
        transport.send(AgentCommand::StopCapture).unwrap();
        assert_eq!(agent.recv_command(), Some(AgentCommand::StopCapture));
        assert!(agent.try_recv_command().is_none());
    }

    #[test]
    fn test_messages_reach_the_dispatch() {
        let (mut transport, agent) = ChannelTransport::pair();
        let (tx, rx) = crossbeam_channel::bounded(4);
        transport.set_dispatch(Box::new(move |message| {
            let _ = tx.try_send(message);
        }));
        agent.send(3, AgentEvent::CaptureFinished).unwrap();

        let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.session_id, 3);
        drop(agent);
        // Dispatch is dropped with the forwarder, closing our channel
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_send_after_agent_dropped() {
        let (transport, agent) = ChannelTransport::pair();
        drop(agent);
        assert!(matches!(
            transport.send(AgentCommand::StopCapture),
            Err(TransportError::Disconnected)
        ));
    }
}
