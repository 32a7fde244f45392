use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::gateway::device_id::DeviceId;

/// The reverse-channel endpoint for one device: a Unix domain socket at
///  `<base_path>/<device_id>` that any number of local operator clients may
///  connect to.
///
/// Lines written by any client become pending commands for the device
///  (many-to-one, with back-pressure when a command is already waiting for
///  its heartbeat window). Responses from the device are written to every
///  connected client, newline-terminated (one-to-many broadcast).
pub struct DeviceBroker {
    device_id: DeviceId,
    socket_path: PathBuf,
    active: Arc<AtomicBool>,
    quit: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    fan_out_task: Mutex<Option<JoinHandle<()>>>,
}

type ClientWriters = Arc<Mutex<Vec<(u64, OwnedWriteHalf)>>>;

impl DeviceBroker {
    pub async fn start(
        device_id: DeviceId,
        base_path: &Path,
        to_device: mpsc::Sender<String>,
        from_device: broadcast::Receiver<String>,
    ) -> anyhow::Result<DeviceBroker> {
        let socket_path = base_path.join(device_id.as_str());

        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!("removed stale socket file {:?}", socket_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove stale socket file {:?}: {}", socket_path, e),
        }

        let listener = UnixListener::bind(&socket_path)?;
        restrict_to_owner(&socket_path).await?;
        info!("command socket for device {} listening at {:?}", device_id, socket_path);

        let (quit, _) = broadcast::channel(1);
        let active = Arc::new(AtomicBool::new(true));
        let writers: ClientWriters = Default::default();

        // the quit subscriptions are created here, before the tasks are
        //  spawned: a subscription made inside a task could miss a quit
        //  signal sent before the task first runs
        let accept_task = tokio::spawn(accept_loop(
            device_id.clone(),
            listener,
            writers.clone(),
            to_device,
            quit.clone(),
            quit.subscribe(),
            active.clone(),
        ));
        let fan_out_task = tokio::spawn(fan_out_loop(
            device_id.clone(),
            from_device,
            writers,
            quit.subscribe(),
        ));

        Ok(DeviceBroker {
            device_id,
            socket_path,
            active,
            quit,
            accept_task: Mutex::new(Some(accept_task)),
            fan_out_task: Mutex::new(Some(fan_out_task)),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// true iff the listener is open and teardown has not begun
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting, disconnect all clients, drain the worker tasks and
    ///  remove the socket file. When this returns the broker's resources
    ///  are released. Idempotent.
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("shutting down command socket for device {}", self.device_id);
        let _ = self.quit.send(());

        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.fan_out_task.lock().await.take() {
            let _ = task.await;
        }

        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove socket file {:?}: {}", self.socket_path, e),
        }
    }
}

async fn restrict_to_owner(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

async fn accept_loop(
    device_id: DeviceId,
    listener: UnixListener,
    writers: ClientWriters,
    to_device: mpsc::Sender<String>,
    quit: broadcast::Sender<()>,
    mut quit_receiver: broadcast::Receiver<()>,
    active: Arc<AtomicBool>,
) {
    let mut next_client_id: u64 = 0;

    loop {
        select! {
            _ = quit_receiver.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        next_client_id += 1;
                        let client_id = next_client_id;
                        info!("new local connection for device {}", device_id);

                        let (read_half, write_half) = stream.into_split();
                        writers.lock().await.push((client_id, write_half));

                        tokio::spawn(client_read_loop(
                            device_id.clone(),
                            client_id,
                            read_half,
                            writers.clone(),
                            to_device.clone(),
                            quit.subscribe(),
                        ));
                    }
                    Err(e) => {
                        if active.load(Ordering::Acquire) {
                            error!("failed to accept local connection for device {}: {}", device_id, e);
                        }
                    }
                }
            }
        }
    }
    // dropping the listener closes the socket; the file itself is removed in stop()
}

/// Reads newline-delimited commands from one client and forwards them to the
///  device's command queue. The awaited send is where operator back-pressure
///  takes effect.
async fn client_read_loop(
    device_id: DeviceId,
    client_id: u64,
    read_half: OwnedReadHalf,
    writers: ClientWriters,
    to_device: mpsc::Sender<String>,
    mut quit: broadcast::Receiver<()>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        select! {
            _ = quit.recv() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(command)) => {
                        info!("user to device {}: {}", device_id, command);
                        if to_device.send(command).await.is_err() {
                            warn!("command queue for device {} is gone, closing connection", device_id);
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("local connection for device {} closed by client", device_id);
                        break;
                    }
                    Err(e) => {
                        warn!("failed to read from local connection for device {}: {}", device_id, e);
                        break;
                    }
                }
            }
        }
    }

    writers.lock().await.retain(|(id, _)| *id != client_id);
}

/// Drains the device's response queue and writes each response to every
///  connected client. A client with a broken pipe is dropped, the others
///  keep receiving.
async fn fan_out_loop(
    device_id: DeviceId,
    mut from_device: broadcast::Receiver<String>,
    writers: ClientWriters,
    mut quit: broadcast::Receiver<()>,
) {
    loop {
        select! {
            _ = quit.recv() => break,
            response = from_device.recv() => {
                match response {
                    Ok(response) => {
                        info!("device {} to user: {}", device_id, response);
                        let line = format!("{}\n", response);

                        let mut writers = writers.lock().await;
                        let mut broken = Vec::new();
                        for (client_id, writer) in writers.iter_mut() {
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                warn!("failed to write to local connection for device {}, dropping it: {}", device_id, e);
                                broken.push(*client_id);
                            }
                        }
                        writers.retain(|(client_id, _)| !broken.contains(client_id));
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("response fan-out for device {} lagging, {} responses dropped", device_id, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    // close all accepted streams so clients see EOF as soon as the broker
    //  goes down, not whenever their reader task gets around to it
    let mut writers = writers.lock().await;
    for (_, writer) in writers.iter_mut() {
        let _ = writer.shutdown().await;
    }
    writers.clear();
}
