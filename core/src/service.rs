// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

/// Stop signal handed to a background task, awaited as a `select!` branch.
pub(crate) struct StopHandle {
    stop_rx: oneshot::Receiver<()>,
}

impl StopHandle {
    /// Resolves once a stop was requested or the owning [`ServiceHandle`] was dropped.
    pub async fn signaled(&mut self) {
        (&mut self.stop_rx).await.unwrap_or_default();
    }
}

/// Keeps a running session alive.
///
/// Dropping the handle stops the session just like [`ServiceHandle::shutdown`], without
/// waiting for its teardown to finish.
pub struct ServiceHandle {
    join: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

impl ServiceHandle {
    /// Stops scanning, disconnects every device and waits for the session task to end.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use ble_session_core::{BluetoothSession, SessionSettings, SimulatedRadio};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let (session, service) = BluetoothSession::start(Arc::new(SimulatedRadio::new()), SessionSettings::default());
    /// session.initialize().await.unwrap();
    /// service.shutdown().await.unwrap();
    /// assert!(session.initialize().await.is_err());
    /// # }
    /// ```
    pub async fn shutdown(self) -> Result<(), JoinError> {
        let _ = self.stop_tx.send(());
        self.join.await
    }
}

/// Runs `f` on a tokio task, handing it the [`StopHandle`] tied to the returned handle.
pub(crate) fn spawn_service<Fut, Func>(f: Func) -> ServiceHandle
where
    Fut: Future<Output = ()> + Send + 'static,
    Func: FnOnce(StopHandle) -> Fut + Send + 'static,
{
    let (stop_tx, stop_rx) = oneshot::channel();
    let join = tokio::spawn(f(StopHandle { stop_rx }));
    ServiceHandle { join, stop_tx }
}
