//! General command processing.
//!
//! Requests other than channel open/close are handed to a [`CommandHandler`].
//! The built-in handler covers session setup and housekeeping; anything it
//! does not know is answered with `NOTSUPPORTED`.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use xvdr_protocol::{opcode, ProtocolError, RequestPacket, ResponsePacket, ReturnCode, PROTOCOL_VERSION};

use crate::server::connection::ConnectionContext;

/// Processes one request and returns the encoded response, if any.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, req: &mut RequestPacket, ctx: &ConnectionContext) -> Option<Bytes>;
}

/// Login, time, status interface and ping.
pub struct BuiltinCommands {
    server_name: String,
    server_version: String,
}

impl BuiltinCommands {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn login(&self, req: &mut RequestPacket, ctx: &ConnectionContext) -> Result<ResponsePacket, ProtocolError> {
        let client_version = req.extract_u32()?;
        let netlog = req.extract_u8()?;
        let client_name = req.extract_string()?;

        if client_version != PROTOCOL_VERSION {
            warn!(
                "[Conn {}] Client '{}' speaks protocol {}, server speaks {}",
                ctx.id, client_name, client_version, PROTOCOL_VERSION
            );
        }
        info!("[Conn {}] Welcome client '{}' with protocol version '{}'", ctx.id, client_name, client_version);
        if netlog != 0 {
            debug!("[Conn {}] Client requested network logging, not supported", ctx.id);
        }

        ctx.logged_in.store(true, Ordering::Release);
        *ctx.client_name.lock() = Some(client_name);

        let mut resp = ResponsePacket::response(req.opcode, req.request_id);
        resp.add_u32(PROTOCOL_VERSION);
        add_time(&mut resp);
        resp.add_string(&self.server_name).add_string(&self.server_version);
        Ok(resp)
    }

    fn enable_status_interface(
        &self,
        req: &mut RequestPacket,
        ctx: &ConnectionContext,
    ) -> Result<ResponsePacket, ProtocolError> {
        let enabled = req.extract_u8()? != 0;
        ctx.status_enabled.store(enabled, Ordering::Release);
        info!(
            "[Conn {}] Status interface {}",
            ctx.id,
            if enabled { "enabled" } else { "disabled" }
        );

        let mut resp = ResponsePacket::response(req.opcode, req.request_id);
        resp.add_u32(ReturnCode::Ok.into());
        Ok(resp)
    }
}

/// Current UTC time and the local offset from UTC in seconds.
fn add_time(resp: &mut ResponsePacket) {
    let now = Utc::now().timestamp() as u32;
    let offset = Local::now().offset().local_minus_utc();
    resp.add_u32(now).add_i32(offset);
}

impl CommandHandler for BuiltinCommands {
    fn handle(&self, req: &mut RequestPacket, ctx: &ConnectionContext) -> Option<Bytes> {
        let resp = match req.opcode {
            opcode::LOGIN => self.login(req, ctx),
            opcode::GET_TIME => {
                let mut resp = ResponsePacket::response(req.opcode, req.request_id);
                add_time(&mut resp);
                Ok(resp)
            }
            opcode::ENABLE_STATUS_INTERFACE => self.enable_status_interface(req, ctx),
            opcode::PING => {
                let mut resp = ResponsePacket::response(req.opcode, req.request_id);
                resp.add_u32(1);
                Ok(resp)
            }
            other => {
                debug!("[Conn {}] Unsupported opcode {}", ctx.id, other);
                let mut resp = ResponsePacket::response(req.opcode, req.request_id);
                resp.add_u32(ReturnCode::NotSupported.into());
                Ok(resp)
            }
        };

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                error!("[Conn {}] Malformed request (opcode {}): {}", ctx.id, req.opcode, e);
                let mut resp = ResponsePacket::response(req.opcode, req.request_id);
                resp.add_u32(ReturnCode::DataInvalid.into());
                resp
            }
        };

        match resp.finalise() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("[Conn {}] Response packet failed: {}", ctx.id, e);
                None
            }
        }
    }
}
