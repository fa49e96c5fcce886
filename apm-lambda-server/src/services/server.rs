use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use apm_lambda_config::Config;
use apm_lambda_log::LogError;
use axum::ServiceExt;
use axum::extract::Request;
use axum::http::{HeaderValue, header};
use axum_server::Handle;
use futures::future::{self, OptionFuture};
use hyper_util::rt::TokioTimer;
use tokio::net::TcpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::constants;
use crate::middlewares::{self, CatchPanicLayer};
use crate::service::ServiceState;

/// Time granted to in-flight requests once the server shuts down.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 1024;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),
}

/// Build the axum application with all routes and middleware.
fn make_app(
    service: ServiceState,
    f: impl FnOnce(&Config) -> axum::Router<ServiceState>,
) -> axum::Router {
    // Layers added first are called first for requests and last for responses.
    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(middlewares::handle_panic))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(constants::SERVER),
        ))
        .layer(middlewares::trace_http_layer());

    f(service.config()).layer(middleware).with_state(service)
}

fn listen(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?.into_std()?)
}

fn serve(
    listener: TcpListener,
    app: axum::Router,
    header_timeout: Duration,
    handle: Handle,
) -> std::io::Result<JoinHandle<()>> {
    let addr = listener.local_addr()?;
    let mut server = axum_server::from_tcp(listener).handle(handle);

    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(header_timeout);

    let service = ServiceExt::<Request>::into_make_service(app);

    Ok(tokio::spawn(async move {
        if let Err(error) = server.serve(service).await {
            apm_lambda_log::error!("http server on {addr} failed: {error}");
        }
    }))
}

/// HTTP server service.
///
/// Hosts the agent intake on the public listener and, if platform logs are enabled, the log
/// receiver on a second listener. Both listeners are bound when the server is created, so the
/// actual ports are known before the logs subscription is made.
#[derive(Debug)]
pub struct HttpServer {
    service: ServiceState,
    listener: TcpListener,
    logs_listener: Option<TcpListener>,
}

impl HttpServer {
    /// Binds the intake listener and, if platform logs are enabled, the log listener.
    pub fn bind(service: ServiceState) -> Result<Self, ServerError> {
        let config = service.config();

        let listener = listen(config.listen_addr())?;
        let logs_listener = match config.logs_enabled() {
            true => Some(listen(config.logs_listen_addr())?),
            false => None,
        };

        Ok(Self {
            service,
            listener,
            logs_listener,
        })
    }

    /// Returns the bound address of the agent intake.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the bound address of the log receiver, if enabled.
    pub fn logs_addr(&self) -> std::io::Result<Option<SocketAddr>> {
        self.logs_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()
    }

    /// Starts serving requests until `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> Result<RunningServer, ServerError> {
        let Self {
            service,
            listener,
            logs_listener,
        } = self;

        let header_timeout = service.config().receiver_timeout();
        apm_lambda_log::info!("spawning http server");
        apm_lambda_log::info!("  listening on http://{}/", listener.local_addr()?);

        let logs = match logs_listener {
            Some(logs_listener) => {
                apm_lambda_log::info!("  listening on http://{}/ [logs]", logs_listener.local_addr()?);
                let handle = Handle::new();
                let app = make_app(service.clone(), crate::endpoints::logs_routes);
                let task = serve(logs_listener, app, header_timeout, handle.clone())?;
                Some((handle, task))
            }
            None => None,
        };

        let handle = Handle::new();
        let app = make_app(service, crate::endpoints::public_routes);
        let task = serve(listener, app, header_timeout, handle.clone())?;

        let mut handles = vec![handle.clone()];
        handles.extend(logs.as_ref().map(|(handle, _)| handle.clone()));
        tokio::spawn(async move {
            token.cancelled().await;
            apm_lambda_log::info!("shutting down http server");
            for handle in handles {
                handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
            }
        });

        Ok(RunningServer {
            public: (handle, task),
            logs,
        })
    }
}

/// Handles to the listeners of a started [`HttpServer`].
#[derive(Debug)]
pub struct RunningServer {
    public: (Handle, JoinHandle<()>),
    logs: Option<(Handle, JoinHandle<()>)>,
}

impl RunningServer {
    /// Returns `true` if the log receiver is serving.
    pub fn has_logs_listener(&self) -> bool {
        self.logs.is_some()
    }

    /// Stops the log receiver while the intake keeps serving.
    pub async fn shutdown_logs(&mut self) {
        if let Some((handle, task)) = self.logs.take() {
            apm_lambda_log::info!("shutting down log receiver");
            handle.shutdown();
            if let Err(error) = task.await {
                apm_lambda_log::error!("log receiver task failed: {}", LogError(&error));
            }
        }
    }

    /// Waits until both listeners have stopped.
    pub async fn join(self) {
        let (_, public) = self.public;
        let logs: OptionFuture<_> = self.logs.map(|(_, task)| task).into();

        let (public, logs) = future::join(public, logs).await;
        if let Err(error) = public {
            apm_lambda_log::error!("http server task failed: {}", LogError(&error));
        }
        if let Some(Err(error)) = logs {
            apm_lambda_log::error!("log receiver task failed: {}", LogError(&error));
        }
    }
}
