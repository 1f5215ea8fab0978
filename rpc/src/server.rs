//! The serving side of a peer connection.

use std::io;

use comms::{
    WireSender,
    msg::{Command, Msg, Request, Response},
    specs::rpc::Reply,
};
use log::{debug, warn};
use tokio::{
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::mpsc,
};

use crate::{Result, RpcAgent, RpcErr, RpcOutput, msg_kind, tensor};

type Outgoing = (u64, Result<RpcOutput>);

/// Serves the requests of a single peer until it disconnects or the agent shuts down.
pub(crate) async fn serve(agent: RpcAgent, stream: TcpStream) {
    if let Err(e) = serve_connection(agent, stream).await {
        warn!("peer connection failed: {e}");
    }
}

async fn serve_connection(agent: RpcAgent, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (mut rx, tx) = comms::channel(rx, tx);
    let mut buf: Vec<f32> = Vec::new();

    let from = match rx.recv_into(&mut buf).await? {
        Msg::Control(Command::Hello { rank }) => rank,
        other => {
            return Err(RpcErr::UnexpectedMessage {
                peer: None,
                got: msg_kind(&other),
            });
        }
    };
    debug!(peer = from; "serving peer");

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_responses(from, tx, out_rx));
    let cancel = agent.cancel_token();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv_into(&mut buf) => msg,
        };

        let Request { id, call, tensor } = match msg {
            Ok(Msg::Request(req)) => req,
            Ok(Msg::Control(Command::Disconnect)) => break,
            Ok(other) => {
                warn!(peer = from; "expected a request, got {}", msg_kind(&other));
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        let tensor = tensor.map(tensor::from_wire).transpose();
        let agent = agent.clone();
        let out_tx = out_tx.clone();

        tokio::spawn(async move {
            let output = match tensor {
                Ok(tensor) => agent.serve_call(from, call, tensor).await,
                Err(e) => Err(e),
            };
            let _ = out_tx.send((id, output));
        });
    }

    debug!(peer = from; "stopped serving peer");
    Ok(())
}

/// Writes the responses in completion order, which may differ from the request order.
async fn write_responses(
    peer: usize,
    mut tx: WireSender<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some((id, output)) = rx.recv().await {
        let (reply, tensor) = match output {
            Ok(RpcOutput { reply, tensor }) => (reply, tensor),
            Err(e) => {
                warn!(peer = peer, id = id; "call failed: {e}");
                let detail = e.to_string();
                (Reply::Err { detail }, None)
            }
        };

        let layout = tensor.as_ref().map(tensor::standard);
        let msg = Msg::Response(Response {
            id,
            reply,
            tensor: layout.as_ref().and_then(tensor::to_wire),
        });

        if let Err(e) = tx.send(&msg).await {
            warn!(peer = peer; "failed to answer: {e}");
            break;
        }
    }
}
