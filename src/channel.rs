// This file is part of SEELE-CORE.
//
// Copyright (C) 2022 Seele Contributors.
//
// SEELE-CORE is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// SEELE-CORE is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with SEELE-CORE. If not, see <https://www.gnu.org/licenses/>.

//! Bounded mpmc channels built on top of the async-std channels.
//!
//! These are the only suspension points shared between tasks: peer transport
//! endpoints, sync triggers, mining results and the event-bus topic queues
//! all use this wrapper. Both asynchronous methods and blocking `_sync`
//! wrappers are provided since PoW workers live on plain threads.

use async_std::{
    channel::{
        self as async_channel, Receiver as AsyncReceiver, Sender as AsyncSender, TryRecvError,
        TrySendError,
    },
    task,
};
use std::{pin::Pin, time::Duration};

/// Default upper bound to outstanding channel elements.
const CHANNEL_BOUND: usize = 1000;

/// Errors which can be triggered by a channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Error during send. Broken channel.
    SendError,
    /// Send refused, channel full.
    SendFull,
    /// Error during receive. Broken channel.
    RecvError,
    /// Receive on an empty channel or timeout expired.
    RecvTimeout,
}

impl std::error::Error for ChannelError {}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ChannelError::SendError => "channel send error",
            ChannelError::SendFull => "channel full",
            ChannelError::RecvError => "channel recv error",
            ChannelError::RecvTimeout => "channel recv timeout",
        };
        write!(f, "{}", msg)
    }
}

/// Creates a channel with the default bound.
pub fn simple_channel<T>() -> (Sender<T>, Receiver<T>) {
    bounded_channel(CHANNEL_BOUND)
}

/// Creates a channel with an explicit bound.
pub fn bounded_channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = async_channel::bounded::<T>(bound);
    (Sender(sender), Receiver(receiver))
}

/// Channel sender side.
#[derive(Clone)]
pub struct Sender<T>(AsyncSender<T>);

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender").finish()
    }
}

impl<T> Sender<T> {
    /// Push one element, waiting for free space if the channel is full.
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        self.0.send(value).await.map_err(|_| ChannelError::SendError)
    }

    /// Push one element, synchronous wrapper.
    pub fn send_sync(&self, value: T) -> Result<(), ChannelError> {
        task::block_on(self.send(value))
    }

    /// Push one element without waiting.
    pub fn try_send(&self, value: T) -> Result<(), ChannelError> {
        self.0.try_send(value).map_err(|err| match err {
            TrySendError::Full(_) => ChannelError::SendFull,
            TrySendError::Closed(_) => ChannelError::SendError,
        })
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed
    /// already. The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Channel receiver side.
#[derive(Clone)]
pub struct Receiver<T>(AsyncReceiver<T>);

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver").finish()
    }
}

impl<T> Receiver<T> {
    /// Collect one element.
    ///
    /// This call is blocking.
    pub async fn recv(&self) -> Result<T, ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Collect one element, giving up after the given timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        let mut timeout = timeout;
        let sleep_time = Duration::from_millis(100);
        loop {
            match self.0.try_recv() {
                Ok(res) => return Ok(res),
                Err(TryRecvError::Empty) if timeout > Duration::from_millis(0) => {
                    task::sleep(sleep_time).await;
                    timeout = timeout
                        .checked_sub(sleep_time)
                        .unwrap_or_else(|| Duration::from_millis(0));
                }
                Err(TryRecvError::Empty) => return Err(ChannelError::RecvTimeout),
                _ => return Err(ChannelError::RecvError),
            }
        }
    }

    /// Collect one element without waiting.
    pub fn try_recv(&self) -> Result<T, ChannelError> {
        self.0.try_recv().map_err(|err| match err {
            TryRecvError::Empty => ChannelError::RecvTimeout,
            TryRecvError::Closed => ChannelError::RecvError,
        })
    }

    /// Collect one element, synchronous wrapper.
    pub fn recv_sync(&self) -> Result<T, ChannelError> {
        task::block_on(self.recv())
    }

    /// Collect one element with timeout, synchronous wrapper.
    pub fn recv_timeout_sync(&self, timeout: Duration) -> Result<T, ChannelError> {
        task::block_on(self.recv_timeout(timeout))
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed
    /// already. The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Stream implementation for [Receiver].
impl<T> futures::Stream for Receiver<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let pin = Pin::new(&mut self.0);
        pin.poll_next(cx)
    }
}
