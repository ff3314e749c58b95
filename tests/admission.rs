//! Worker-pool admission control under saturation.

mod testsvc;

use grpcmux::server::{implements, stream_handler, ServiceDesc, StreamDesc};
use grpcmux::{Client, ClientOptions, Server, ServerOptions, ServerStream};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tonic::{Code, Status};

const BLOCK_METHOD: &str = "/test.BlockService/Block";

/// A streaming service whose handler parks until released.
struct BlockService {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Semaphore>,
}

impl BlockService {
    async fn block(self: Arc<Self>, _stream: ServerStream) -> Result<(), Status> {
        let _ = self.started.send(());
        self.release
            .acquire()
            .await
            .map_err(|_| Status::aborted("released"))?
            .forget();
        Ok(())
    }

    fn desc() -> ServiceDesc {
        ServiceDesc {
            name: "test.BlockService",
            handler_check: implements::<BlockService>,
            methods: Vec::new(),
            streams: vec![StreamDesc {
                name: "Block",
                client_streams: true,
                server_streams: true,
                handler: stream_handler(|svc: Arc<BlockService>, stream| svc.block(stream)),
            }],
            metadata: "test.proto",
        }
    }
}

#[tokio::test]
async fn test_saturated_pool_rejects_with_resource_exhausted() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));

    let (client_tunnel, server_tunnel) = grpcmux::tunnel::pair();
    let server = Server::new(ServerOptions::new().max_worker(1));
    server.register_service(
        BlockService::desc(),
        Arc::new(BlockService {
            started: started_tx,
            release: release.clone(),
        }),
    );
    let _serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(Arc::new(server_tunnel)).await })
    };
    let client = Client::new(Arc::new(client_tunnel), ClientOptions::new());

    // First session occupies the single worker.
    let first = client.new_stream(BLOCK_METHOD).await.unwrap();
    started_rx.recv().await.unwrap();

    // Two more fill the intake queue (capacity 2 * max_worker).
    let second = client.new_stream(BLOCK_METHOD).await.unwrap();
    let third = client.new_stream(BLOCK_METHOD).await.unwrap();

    // The fourth is refused admission outright.
    let fourth = client.new_stream(BLOCK_METHOD).await.unwrap();
    let err = fourth.recv_msg::<testsvc::BidiResponse>().await.unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(err.message(), "too many requests");

    // Releasing the handlers drains the queued sessions normally.
    release.add_permits(3);
    for stream in [&first, &second, &third] {
        assert!(stream
            .recv_msg::<testsvc::BidiResponse>()
            .await
            .unwrap()
            .is_none());
    }

    fourth.close().await;
    first.close().await;
    second.close().await;
    third.close().await;
    client.close();
    server.close();
}

#[tokio::test]
async fn test_unbounded_server_accepts_everything() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));

    let (client_tunnel, server_tunnel) = grpcmux::tunnel::pair();
    let server = Server::new(ServerOptions::new().max_worker(0));
    server.register_service(
        BlockService::desc(),
        Arc::new(BlockService {
            started: started_tx,
            release: release.clone(),
        }),
    );
    let _serve = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(Arc::new(server_tunnel)).await })
    };
    let client = Client::new(Arc::new(client_tunnel), ClientOptions::new());

    let mut streams = Vec::new();
    for _ in 0..8 {
        let stream = client.new_stream(BLOCK_METHOD).await.unwrap();
        started_rx.recv().await.unwrap();
        streams.push(stream);
    }

    release.add_permits(8);
    for stream in &streams {
        assert!(stream
            .recv_msg::<testsvc::BidiResponse>()
            .await
            .unwrap()
            .is_none());
        stream.close().await;
    }

    client.close();
    server.close();
}
