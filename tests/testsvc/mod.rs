//! Shared test service: messages, handlers, descriptors, and the in-memory
//! client/server harness the integration tests run against.
#![allow(dead_code)]

use grpcmux::middleware::{Context, Handler, Middleware};
use grpcmux::server::{implements, stream_handler, unary_handler, ServiceDesc, StreamDesc};
use grpcmux::{
    Client, ClientOptions, Metadata, Server, ServerOptions, ServerStream,
};
use std::sync::Arc;
use tonic::{Code, Status};

pub const ECHO_SERVICE: &str = "test.EchoService";
pub const ECHO_METHOD: &str = "/test.EchoService/Echo";
pub const FAIL_METHOD: &str = "/test.EchoService/Fail";
pub const BIDI_METHOD: &str = "/test.EchoService/BidiEcho";
pub const AUTH_KEY: &str = "c-auth";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FailRequest {
    #[prost(string, tag = "1")]
    pub message: String,
    /// Status code the handler should fail with; 0 means succeed.
    #[prost(int32, tag = "2")]
    pub code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(string, tag = "2")]
    pub echo: String,
}

macro_rules! test_name {
    ($ty:ident) => {
        impl ::prost::Name for $ty {
            const NAME: &'static str = stringify!($ty);
            const PACKAGE: &'static str = "test";

            fn full_name() -> String {
                concat!("test.", stringify!($ty)).to_string()
            }

            fn type_url() -> String {
                concat!("/test.", stringify!($ty)).to_string()
            }
        }
    };
}

test_name!(EchoRequest);
test_name!(EchoResponse);
test_name!(FailRequest);
test_name!(BidiRequest);
test_name!(BidiResponse);

/// The test service implementation.
#[derive(Default)]
pub struct EchoService;

impl EchoService {
    async fn echo(
        self: Arc<Self>,
        _ctx: Context,
        request: EchoRequest,
    ) -> Result<EchoResponse, Status> {
        Ok(EchoResponse {
            message: format!("Echo: {}", request.message),
        })
    }

    async fn fail(
        self: Arc<Self>,
        _ctx: Context,
        request: FailRequest,
    ) -> Result<EchoResponse, Status> {
        if request.code == 0 {
            return Ok(EchoResponse {
                message: "No error".to_string(),
            });
        }
        Err(Status::new(
            Code::from(request.code),
            format!("Not found: {}", request.message),
        ))
    }

    async fn bidi_echo(self: Arc<Self>, stream: ServerStream) -> Result<(), Status> {
        while let Some(request) = stream.recv_msg::<BidiRequest>().await? {
            stream
                .send_msg(&BidiResponse {
                    request_id: request.id,
                    echo: format!("Echo: {}", request.message),
                })
                .await?;
        }
        Ok(())
    }
}

pub fn echo_service_desc() -> ServiceDesc {
    ServiceDesc {
        name: ECHO_SERVICE,
        handler_check: implements::<EchoService>,
        methods: vec![
            grpcmux::server::MethodDesc {
                name: "Echo",
                handler: unary_handler(|svc: Arc<EchoService>, ctx, req| svc.echo(ctx, req)),
            },
            grpcmux::server::MethodDesc {
                name: "Fail",
                handler: unary_handler(|svc: Arc<EchoService>, ctx, req| svc.fail(ctx, req)),
            },
        ],
        streams: vec![StreamDesc {
            name: "BidiEcho",
            client_streams: true,
            server_streams: true,
            handler: stream_handler(|svc: Arc<EchoService>, stream| svc.bidi_echo(stream)),
        }],
        metadata: "test.proto",
    }
}

/// Client middleware: attach an auth token to the outgoing metadata.
pub fn with_auth(token: &str) -> Middleware {
    let token = token.to_string();
    Arc::new(move |next: Handler| {
        let token = token.clone();
        Arc::new(move |mut ctx: Context, request| {
            ctx.metadata_mut().append(AUTH_KEY, token.clone());
            next(ctx, request)
        })
    })
}

/// Server middleware: reject calls whose auth token does not match.
pub fn require_auth(token: &str) -> Middleware {
    let token = token.to_string();
    Arc::new(move |next: Handler| {
        let token = token.clone();
        Arc::new(move |ctx: Context, request| {
            if ctx.metadata().get(AUTH_KEY) == Some(token.as_str()) {
                next(ctx, request)
            } else {
                let status =
                    Status::unauthenticated(format!("request unauthenticated with {AUTH_KEY}"));
                Box::pin(async move { Err(status) })
            }
        })
    })
}

/// Opt-in test logging, driven by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A connected client/server pair over an in-memory tunnel, with the echo
/// service registered.
pub fn start_pair(
    client_options: ClientOptions,
    server_options: ServerOptions,
) -> (Client, Server, tokio::task::JoinHandle<grpcmux::Result<()>>) {
    init_logging();
    let (client_tunnel, server_tunnel) = grpcmux::tunnel::pair();

    let server = Server::new(server_options);
    server.register_service(echo_service_desc(), Arc::new(EchoService));
    let serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(Arc::new(server_tunnel)).await })
    };

    let client = Client::new(Arc::new(client_tunnel), client_options);
    (client, server, serve)
}

/// Convenience: metadata with a single pair.
pub fn md(key: &str, value: &str) -> Metadata {
    Metadata::from_pairs([(key, value)])
}
