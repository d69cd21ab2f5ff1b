use application::{ClientCommand, Credentials, OutboundFrame, Session};
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket 连接
///
/// 把一条 WebSocket 连接接到应用层的 [`Session`] 上：
/// - 发送任务把会话的出站帧序列化后写回客户端
/// - 接收任务把文本帧逐条交给会话处理
///
/// 任一任务结束都会关闭会话，注册表中的登记随之撤销。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    credentials: Credentials,
    room: Option<String>,
}

impl WebSocketConnection {
    pub fn new(
        socket: WebSocket,
        state: AppState,
        credentials: Credentials,
        room: Option<String>,
    ) -> Self {
        Self {
            socket,
            state,
            credentials,
            room,
        }
    }

    /// 运行连接直到任意一端断开。
    pub async fn run(self) {
        let Self {
            mut socket,
            state,
            credentials,
            room,
        } = self;

        let mut session = state.engine.open_session();
        let mut outbound = match session.admit(&credentials).await {
            Ok(outbound) => outbound,
            Err(_) => {
                // 认证失败直接关闭，不回写错误内容
                let close = CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static(""),
                };
                if socket.send(WsMessage::Close(Some(close))).await.is_err() {
                    tracing::debug!("关闭未认证连接时对端已断开");
                }
                return;
            }
        };

        if let Some(room) = room {
            session.execute(ClientCommand::JoinRoom { room }).await;
        }

        let user_id = session.user_id();
        let closed = session.closed_token();
        let (mut sender, mut incoming) = socket.split();

        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let send_task = {
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let command = tokio::select! {
                        _ = closed.cancelled() => break,
                        Some(cmd) = cmd_rx.recv() => cmd,
                        frame = outbound.recv() => match frame {
                            Some(frame) => match encode(&frame) {
                                Some(text) => WsCommand::SendText(text),
                                None => continue,
                            },
                            None => break,
                        },
                    };
                    let message = match command {
                        WsCommand::SendText(text) => WsMessage::Text(text.into()),
                        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                    };
                    if sender.send(message).await.is_err() {
                        tracing::warn!("WebSocket 写入失败");
                        break;
                    }
                }
                // 写端已不可用，通知接收任务在指令之间退出
                closed.cancel();
                let _ = sender.close().await;
                tracing::debug!("WebSocket发送任务结束");
            })
        };

        // 接收任务：指令严格串行处理，只在两条指令之间观察关闭信号
        let recv_task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = closed.cancelled() => break,
                    message = incoming.next() => message,
                };
                let Some(Ok(message)) = message else {
                    break;
                };
                if Self::handle_incoming(message, &mut session, &cmd_tx)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            session.close();
            tracing::debug!("WebSocket接收任务结束");
        });

        let (send_result, recv_result) = tokio::join!(send_task, recv_task);
        if let Err(err) = send_result.and(recv_result) {
            tracing::error!(error = %err, "WebSocket任务异常退出");
        }
        tracing::info!(user_id = ?user_id, "WebSocket连接已断开");
    }

    /// 处理来自客户端的消息
    async fn handle_incoming(
        message: WsMessage,
        session: &mut Session,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::info!("WebSocket收到关闭消息");
                return Err(());
            }
            WsMessage::Ping(data) => {
                tracing::debug!("收到ping消息，发送pong回应");
                if cmd_tx
                    .send(WsCommand::SendPong(data.to_vec()))
                    .await
                    .is_err()
                {
                    tracing::warn!("Failed to send pong command");
                    return Err(());
                }
            }
            WsMessage::Pong(_) => {
                tracing::debug!("收到pong消息");
            }
            WsMessage::Text(text) => {
                session.process(text.as_str()).await;
            }
            WsMessage::Binary(_) => {
                tracing::debug!("忽略二进制帧");
            }
        }
        Ok(())
    }
}

fn encode(frame: &OutboundFrame) -> Option<String> {
    match frame.to_json() {
        Ok(json) => Some(json),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket payload");
            None
        }
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}
