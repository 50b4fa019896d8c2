//! Server session state machine: accepts inbound FPDUs, produces the
//! response the protocol requires, and drives the per-connection state.
//!
//! Dispatch is a single match over (state, frame type); anything not in the
//! table answers ABORT with a protocol-sequence diagnostic and ends the
//! session.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::connect::{sync_points_value, MAX_SYNC_WINDOW, PROTOCOL_VERSION};
use crate::diag::Diag;
use crate::error::EngineError;
use crate::fpdu::{Fpdu, FpduType};
use crate::param::{Pgi, PgiValue, Pi, PiValue};
use crate::parse::parse_entity;
use crate::state::{MessageBuffer, ServerState, SessionContext, TransferContext};
use crate::store::{
    FileStore, InterruptedTransfer, PartnerCheck, PartnerDirectory, TransferRegistry,
    TransferTracker,
};
use crate::transport::TransportChannel;
use crate::validate;
use crate::writer::{split_articles, ChunkWriter};

pub struct SessionHandler<S, P, T> {
    store: S,
    partners: P,
    tracker: T,
    registry: TransferRegistry,
}

impl<S: FileStore, P: PartnerDirectory, T: TransferTracker> SessionHandler<S, P, T> {
    pub fn new(store: S, partners: P, tracker: T) -> Self {
        SessionHandler {
            store,
            partners,
            tracker,
            registry: TransferRegistry::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Blocking read/process/write loop for one connection. Runs until the
    /// session returns to idle, aborts, times out, or the peer disconnects.
    pub fn run_session(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        info!(session = %ctx.session_id, remote = %ctx.remote_address, "session started");
        loop {
            let entity = match chan.receive() {
                Ok(entity) => entity,
                Err(crate::error::TransportError::Timeout) => {
                    warn!(session = %ctx.session_id, "read timeout, closing");
                    break;
                }
                Err(crate::error::TransportError::Closed) => {
                    info!(session = %ctx.session_id, "peer disconnected");
                    break;
                }
                Err(err) => {
                    error!(session = %ctx.session_id, error = %err, "receive failed");
                    return Err(err.into());
                }
            };
            if let Err(err) = self.process_entity(ctx, &entity, chan) {
                match err {
                    EngineError::Codec(e) => {
                        warn!(session = %ctx.session_id, error = %e, "unparseable entity dropped");
                        continue;
                    }
                    other => return Err(other),
                }
            }
            if ctx.is_finished() {
                info!(session = %ctx.session_id, aborted = ctx.aborted, "session ended");
                break;
            }
        }
        Ok(())
    }

    /// Parse one transport entity and dispatch every logical frame in it.
    pub fn process_entity(
        &self,
        ctx: &mut SessionContext,
        entity: &[u8],
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        for fpdu in parse_entity(entity)? {
            debug!(session = %ctx.session_id, kind = ?fpdu.kind(), "frame received");
            self.dispatch(ctx, &fpdu, chan)?;
            if ctx.aborted {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        use FpduType::*;
        use ServerState::*;
        match (ctx.state, fpdu.kind()) {
            (Cn01Idle, Connect) => self.on_connect(ctx, fpdu, chan),
            (Cn03Connected, Create) => self.on_create(ctx, fpdu, chan),
            (Cn03Connected, Select) => self.on_select(ctx, fpdu, chan),
            (Cn03Connected, Msg) => self.on_msg(ctx, fpdu, chan),
            (Cn03Connected, Msgdm) => self.on_msgdm(ctx, fpdu),
            (MsgReceiving, Msgmm) => self.on_msgmm(ctx, fpdu),
            (MsgReceiving, Msgfm) => self.on_msgfm(ctx, fpdu, chan),
            (Of02FileOpen, Open) => self.on_open(ctx, chan),
            (Of02FileOpen, Close) => self.on_close(ctx, chan),
            (Of02FileOpen, Write) => self.on_write(ctx, fpdu, chan),
            (Of02FileOpen, Read) => self.on_read(ctx, fpdu, chan),
            (Of02FileOpen, Deselect) => self.on_deselect(ctx, chan),
            (Tde02bReceiving, Dtf | Dtfma | Dtfda | Dtffa) => self.on_dtf(ctx, fpdu, chan),
            (Tde02bReceiving, Syn) => self.on_syn(ctx, fpdu, chan),
            (Tde02bReceiving, Resyn) => self.on_resyn(ctx, fpdu, chan),
            (Tde02bReceiving, DtfEnd) => self.on_dtf_end(ctx, fpdu),
            (Tde02bReceiving | Tdl02bSending, Idt) => self.on_idt(ctx, chan),
            (Tde07WriteEnd, TransEnd) => self.on_trans_end_write(ctx, fpdu, chan),
            (Tdl02bSending, TransEnd) => self.on_trans_end_read(ctx, chan),
            (_, Release) => self.on_release(ctx, fpdu, chan),
            (_, Abort) => {
                self.on_abort_received(ctx, fpdu);
                Ok(())
            }
            (state, kind) => {
                warn!(
                    session = %ctx.session_id,
                    state = ?state,
                    kind = ?kind,
                    "frame not legal in this state"
                );
                self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR)
            }
        }
    }

    // Session establishment.

    fn on_connect(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        if let Err(rejection) = validate::validate_connect(fpdu) {
            return self.rconnect(ctx, chan, rejection.diag, &rejection.detail);
        }

        let partner = fpdu.text(Pi::Requester).unwrap_or_default();
        let password = fpdu.text(Pi::AccessControl);
        match self.partners.authenticate(&partner, password.as_deref()) {
            PartnerCheck::Accepted => {}
            PartnerCheck::Unknown => {
                return self.rconnect(
                    ctx,
                    chan,
                    Diag::UNKNOWN_IDENTIFICATION,
                    &format!("unknown partner {partner}"),
                )
            }
            PartnerCheck::Denied | PartnerCheck::Disabled => {
                return self.rconnect(
                    ctx,
                    chan,
                    Diag::UNAUTHORIZED_REQUESTER,
                    &format!("partner {partner} not authorized"),
                )
            }
        }

        ctx.partner = Some(partner.clone());
        ctx.client_connection_id = fpdu.id_src();
        ctx.capabilities.version = fpdu
            .num(Pi::Version)
            .unwrap_or(PROTOCOL_VERSION)
            .min(PROTOCOL_VERSION) as u32;
        let sync_offered = fpdu.param(Pi::SyncPoints).map(|p| p.value.clone());
        if let Some(value) = &sync_offered {
            if value.len() >= 3 {
                ctx.capabilities.sync_interval_kb = u16::from_be_bytes([value[0], value[1]]);
                ctx.capabilities.sync_ack_window = value[2].min(MAX_SYNC_WINDOW);
            }
        }
        ctx.capabilities.resync = fpdu.num(Pi::Resync) == Some(1);

        let mut ack = Fpdu::new(FpduType::Aconnect)
            .with_id_dst(ctx.client_connection_id)
            .with_id_src(ctx.server_connection_id)
            .with_param(PiValue::num(Pi::Version, ctx.capabilities.version as u64));
        if sync_offered.is_some() {
            ack = ack.with_param(PiValue::new(
                Pi::SyncPoints,
                sync_points_value(
                    ctx.capabilities.sync_interval_kb,
                    ctx.capabilities.sync_ack_window,
                )
                .to_vec(),
            ));
        }
        if ctx.capabilities.resync {
            ack = ack.with_param(PiValue::num(Pi::Resync, 1));
        }
        self.reply(chan, &ack)?;
        info!(session = %ctx.session_id, partner = %partner, "partner connected");
        ctx.transition_to(ServerState::Cn03Connected);
        Ok(())
    }

    fn rconnect(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
        diag: Diag,
        detail: &str,
    ) -> Result<(), EngineError> {
        warn!(session = %ctx.session_id, diag = %diag, detail, "connection rejected");
        let reply = Fpdu::new(FpduType::Rconnect)
            .with_param(PiValue::new(Pi::Diagnostic, diag.to_bytes().to_vec()))
            .with_param(PiValue::text(Pi::FreeText, detail));
        self.reply(chan, &reply)?;
        ctx.aborted = true;
        Ok(())
    }

    // File open and close.

    fn on_create(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let max_entity = fpdu.num(Pi::MaxEntitySize).unwrap_or(0);
        if let Err(rejection) = validate::validate_create(fpdu) {
            return self.create_nack(ctx, chan, rejection.diag, max_entity);
        }
        let filename = fpdu.text(Pi::Filename).unwrap_or_default();
        let partner = ctx.partner.clone().unwrap_or_default();
        if !self.partners.transfer_allowed(&partner, &filename, true) {
            return self.create_nack(ctx, chan, Diag::TRANSFER_REFUSED, max_entity);
        }

        let transfer_id = fpdu.num(Pi::TransferId).unwrap_or(0) as u32;
        let mut transfer = TransferContext::new(transfer_id, &filename, true);
        transfer.file_type = fpdu.num(Pi::FileType).unwrap_or(0) as u32;
        transfer.priority = fpdu.num(Pi::Priority).unwrap_or(0) as u8;
        transfer.data_code = fpdu.num(Pi::DataCode).unwrap_or(0) as u8;
        transfer.max_entity_size = max_entity as u32;
        transfer.record_format = fpdu.num(Pi::ArticleFormat).unwrap_or(0) as u8;
        transfer.record_length = fpdu.num(Pi::ArticleLength).unwrap_or(0) as u32;
        transfer.announced_kb = fpdu.num(Pi::MaxReservation).unwrap_or(0);
        transfer.restart = fpdu.num(Pi::TransferRestart) == Some(1);
        transfer.started_at = Some(Utc::now());
        info!(
            session = %ctx.session_id,
            filename = %filename,
            transfer_id,
            "write transfer created"
        );
        ctx.transfer = Some(transfer);

        let ack = Fpdu::new(FpduType::AckCreate)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::SUCCESS.to_bytes().to_vec(),
            ))
            .with_param(PiValue::num(Pi::TransferId, transfer_id as u64))
            .with_param(PiValue::num(Pi::MaxEntitySize, max_entity));
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Of02FileOpen);
        Ok(())
    }

    fn create_nack(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
        diag: Diag,
        max_entity: u64,
    ) -> Result<(), EngineError> {
        warn!(session = %ctx.session_id, diag = %diag, "create refused");
        let ack = Fpdu::new(FpduType::AckCreate)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(Pi::Diagnostic, diag.to_bytes().to_vec()))
            .with_param(PiValue::num(Pi::MaxEntitySize, max_entity));
        self.reply(chan, &ack)
    }

    fn on_select(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        if let Err(rejection) = validate::validate_select(fpdu) {
            return self.select_nack(ctx, fpdu, chan, rejection.diag);
        }
        let filename = fpdu.text(Pi::Filename).unwrap_or_default();
        let partner = ctx.partner.clone().unwrap_or_default();
        if !self.partners.transfer_allowed(&partner, &filename, false) {
            return self.select_nack(ctx, fpdu, chan, Diag::TRANSFER_REFUSED);
        }
        match self.store.exists(&filename) {
            Ok(true) => {}
            Ok(false) => return self.select_nack(ctx, fpdu, chan, Diag::NO_SUCH_FILE),
            Err(err) => {
                warn!(session = %ctx.session_id, error = %err, "store lookup failed");
                return self.select_nack(ctx, fpdu, chan, Diag::BLOCKING_IO_ERROR);
            }
        }
        let size = self.store.size(&filename).unwrap_or(0);
        let modified = self
            .store
            .modified(&filename)
            .unwrap_or_else(|_| Utc::now());

        let transfer_id = fpdu.num(Pi::TransferId).unwrap_or(0) as u32;
        let max_entity = fpdu.num(Pi::MaxEntitySize).unwrap_or(0);
        let mut transfer = TransferContext::new(transfer_id, &filename, false);
        transfer.file_type = fpdu.num(Pi::FileType).unwrap_or(0) as u32;
        transfer.max_entity_size = max_entity as u32;
        transfer.started_at = Some(Utc::now());
        info!(
            session = %ctx.session_id,
            filename = %filename,
            transfer_id,
            size,
            "read transfer selected"
        );
        ctx.transfer = Some(transfer);

        let ack = Fpdu::new(FpduType::AckSelect)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::SUCCESS.to_bytes().to_vec(),
            ))
            .with_param(file_id_group(fpdu, &filename)?)
            .with_param(PiValue::num(Pi::TransferId, transfer_id as u64))
            .with_param(PiValue::num(Pi::MaxEntitySize, max_entity))
            .with_param(PgiValue::new(
                Pgi::LogicalAttrs,
                vec![
                    PiValue::num(Pi::ArticleFormat, crate::connect::ARTICLE_FORMAT_VARIABLE),
                    PiValue::num(Pi::ArticleLength, 0),
                ],
            )?)
            .with_param(PgiValue::new(
                Pgi::PhysicalAttrs,
                vec![
                    PiValue::num(Pi::ReservationUnit, 0),
                    PiValue::num(Pi::MaxReservation, size.div_ceil(1024)),
                ],
            )?)
            .with_param(PgiValue::new(
                Pgi::HistoryAttrs,
                vec![PiValue::text(
                    Pi::CreationDate,
                    &modified.format("%y%m%d%H%M%S").to_string(),
                )],
            )?);
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Of02FileOpen);
        Ok(())
    }

    fn select_nack(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
        diag: Diag,
    ) -> Result<(), EngineError> {
        warn!(session = %ctx.session_id, diag = %diag, "select refused");
        let filename = fpdu.text(Pi::Filename).unwrap_or_default();
        let ack = Fpdu::new(FpduType::AckSelect)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(Pi::Diagnostic, diag.to_bytes().to_vec()))
            .with_param(file_id_group(fpdu, &filename)?)
            .with_param(PiValue::num(
                Pi::TransferId,
                fpdu.num(Pi::TransferId).unwrap_or(0),
            ))
            .with_param(PiValue::num(
                Pi::MaxEntitySize,
                fpdu.num(Pi::MaxEntitySize).unwrap_or(0),
            ))
            .with_param(PgiValue::new(
                Pgi::LogicalAttrs,
                vec![PiValue::num(Pi::ArticleLength, 0)],
            )?)
            .with_param(PgiValue::new(
                Pgi::PhysicalAttrs,
                vec![PiValue::num(Pi::MaxReservation, 0)],
            )?)
            .with_param(PgiValue::new(
                Pgi::HistoryAttrs,
                vec![PiValue::text(Pi::CreationDate, "000000000000")],
            )?);
        self.reply(chan, &ack)
    }

    fn on_open(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let ack = self.file_ack(ctx, FpduType::AckOpen, Diag::SUCCESS);
        self.reply(chan, &ack)
    }

    fn on_close(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let ack = self.file_ack(ctx, FpduType::AckClose, Diag::SUCCESS);
        self.reply(chan, &ack)
    }

    fn on_deselect(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        ctx.transfer = None;
        let ack = self.file_ack(ctx, FpduType::AckDeselect, Diag::SUCCESS);
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Cn03Connected);
        Ok(())
    }

    // Data transfer, write direction.

    fn on_write(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        let requested = fpdu.num(Pi::RestartPoint).unwrap_or(0) as u32;
        let Some(transfer) = ctx.transfer.as_mut() else {
            return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
        };
        if !transfer.write_mode {
            return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
        }

        // Resume only lines up when the peer restarts from the exact sync
        // point the interrupted snapshot recorded; otherwise start over.
        let mut ack_point = 0u32;
        if requested > 0 {
            if let Some(snapshot) =
                self.registry
                    .take(&partner, &transfer.filename, transfer.transfer_id)
            {
                if snapshot.sync_point == requested {
                    transfer.data = snapshot.data;
                    transfer.bytes_transferred = snapshot.bytes_transferred;
                    transfer.current_sync_point = snapshot.sync_point;
                    transfer
                        .sync_offsets
                        .insert(snapshot.sync_point, snapshot.offset);
                    transfer.restart = true;
                    ack_point = requested;
                } else {
                    warn!(
                        session = %ctx.session_id,
                        requested,
                        recorded = snapshot.sync_point,
                        "restart point mismatch, starting over"
                    );
                }
            }
        }
        if let Some(transfer) = ctx.transfer.as_mut() {
            transfer.restart_point = ack_point;
            self.tracker.transfer_started(&partner, transfer);
        }

        let ack = self
            .file_ack(ctx, FpduType::AckWrite, Diag::SUCCESS)
            .with_param(PiValue::num(Pi::RestartPoint, ack_point as u64));
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Tde02bReceiving);
        Ok(())
    }

    fn on_dtf(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let rejection = {
            let Some(transfer) = ctx.transfer.as_mut() else {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            };
            let payload = fpdu.data();
            let result = validate::validate_dtf(payload, transfer).and_then(|_| {
                if fpdu.kind() == FpduType::Dtfma {
                    for article in split_articles(payload) {
                        validate::validate_dtf(&article, transfer)?;
                        transfer.append(&article);
                    }
                } else {
                    transfer.append(payload);
                }
                validate::validate_file_size(transfer.bytes_transferred, transfer.announced_kb)
            });
            result.err()
        };
        match rejection {
            // No response while data flows.
            None => Ok(()),
            Some(rejection) => {
                error!(session = %ctx.session_id, detail = %rejection.detail, "data refused");
                if let Some(transfer) = &ctx.transfer {
                    self.tracker
                        .transfer_failed(transfer.transfer_id, rejection.diag);
                }
                self.abort_session(ctx, chan, rejection.diag)
            }
        }
    }

    fn on_syn(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let outcome = {
            let Some(transfer) = ctx.transfer.as_mut() else {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            };
            match validate::validate_syn(fpdu, transfer) {
                Ok(sync_point) => {
                    transfer.mark_sync(sync_point);
                    self.tracker.sync_point(
                        transfer.transfer_id,
                        sync_point,
                        transfer.bytes_transferred,
                    );
                    Ok(sync_point)
                }
                Err(rejection) => Err(rejection),
            }
        };
        match outcome {
            Ok(sync_point) => {
                // ACK_SYN echoes the sync point number; this echo is what
                // the peer resumes from after an interruption.
                let ack = self
                    .file_ack(ctx, FpduType::AckSyn, Diag::SUCCESS)
                    .with_param(PiValue::num(Pi::SyncNumber, sync_point as u64));
                self.reply(chan, &ack)
            }
            Err(rejection) => {
                warn!(session = %ctx.session_id, detail = %rejection.detail, "sync refused");
                self.abort_session(ctx, chan, rejection.diag)
            }
        }
    }

    fn on_resyn(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let requested = fpdu.num(Pi::RestartPoint).unwrap_or(0) as u32;
        let rewound = {
            let Some(transfer) = ctx.transfer.as_mut() else {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            };
            transfer.rewind_to(requested)
        };
        match rewound {
            Some(offset) => {
                info!(session = %ctx.session_id, requested, offset, "resynchronized");
                let ack = self
                    .file_ack(ctx, FpduType::AckResyn, Diag::SUCCESS)
                    .with_param(PiValue::num(Pi::RestartPoint, requested as u64));
                self.reply(chan, &ack)
            }
            None => self.abort_session(ctx, chan, Diag::RESYNC_IMPOSSIBLE),
        }
    }

    fn on_dtf_end(&self, ctx: &mut SessionContext, fpdu: &Fpdu) -> Result<(), EngineError> {
        if let Some(diag) = fpdu.diagnostic() {
            if !diag.is_success() {
                warn!(session = %ctx.session_id, diag = %diag, "data phase ended abnormally");
            }
        }
        ctx.transition_to(ServerState::Tde07WriteEnd);
        Ok(())
    }

    fn on_idt(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        if let Some(transfer) = ctx.transfer.as_mut() {
            transfer.interrupted = true;
            if transfer.write_mode {
                // Keep only data covered by the last acknowledged sync point
                // so a resuming peer continues from there.
                let offset = transfer.rewind_to(transfer.current_sync_point).unwrap_or(0);
                self.registry.put(
                    &partner,
                    &transfer.filename,
                    transfer.transfer_id,
                    InterruptedTransfer {
                        sync_point: transfer.current_sync_point,
                        offset,
                        bytes_transferred: transfer.bytes_transferred,
                        data: transfer.data.clone(),
                    },
                );
            }
            self.tracker
                .transfer_failed(transfer.transfer_id, Diag::VOLUNTARY_ABORT);
        }
        let ack = Fpdu::new(FpduType::AckIdt).with_id_dst(ctx.client_connection_id);
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Of02FileOpen);
        Ok(())
    }

    fn on_trans_end_write(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        let outcome = {
            let Some(transfer) = ctx.transfer.as_mut() else {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            };
            validate::validate_trans_end(fpdu, transfer)
                .and_then(|_| {
                    validate::validate_file_size(transfer.bytes_transferred, transfer.announced_kb)
                })
                .map(|_| {
                    (
                        transfer.filename.clone(),
                        transfer.transfer_id,
                        transfer.bytes_transferred,
                        transfer.records_transferred,
                    )
                })
        };

        match outcome {
            Err(rejection) => {
                error!(session = %ctx.session_id, detail = %rejection.detail, "transfer end refused");
                if let Some(transfer) = &ctx.transfer {
                    self.tracker
                        .transfer_failed(transfer.transfer_id, rejection.diag);
                }
                let ack = self.file_ack(ctx, FpduType::AckTransEnd, rejection.diag);
                self.reply(chan, &ack)?;
                ctx.transition_to(ServerState::Of02FileOpen);
                Ok(())
            }
            Ok((filename, transfer_id, bytes, records)) => {
                let data = ctx
                    .transfer
                    .as_mut()
                    .map(|t| std::mem::take(&mut t.data))
                    .unwrap_or_default();
                if let Err(err) = self.store.write(&filename, &data) {
                    error!(session = %ctx.session_id, error = %err, "commit failed");
                    self.tracker
                        .transfer_failed(transfer_id, Diag::BLOCKING_IO_ERROR);
                    let ack = self.file_ack(ctx, FpduType::AckTransEnd, Diag::BLOCKING_IO_ERROR);
                    self.reply(chan, &ack)?;
                    ctx.transition_to(ServerState::Of02FileOpen);
                    return Ok(());
                }
                self.registry.remove(&partner, &filename, transfer_id);
                if let Some(transfer) = ctx.transfer.as_mut() {
                    transfer.ended_at = Some(Utc::now());
                    transfer.interrupted = false;
                }
                self.tracker.transfer_completed(transfer_id, bytes, records);
                info!(
                    session = %ctx.session_id,
                    filename = %filename,
                    bytes,
                    records,
                    "file committed"
                );
                let ack = self
                    .file_ack(ctx, FpduType::AckTransEnd, Diag::SUCCESS)
                    .with_param(PiValue::num(Pi::ByteCount, bytes))
                    .with_param(PiValue::num(Pi::ArticleCount, records));
                self.reply(chan, &ack)?;
                ctx.transition_to(ServerState::Of02FileOpen);
                Ok(())
            }
        }
    }

    // Data transfer, read direction.

    fn on_read(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        let requested = fpdu.num(Pi::RestartPoint).unwrap_or(0) as u32;
        let (filename, max_entity) = {
            let Some(transfer) = ctx.transfer.as_ref() else {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            };
            if transfer.write_mode {
                return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
            }
            (transfer.filename.clone(), transfer.max_entity_size)
        };

        let mut offset = 0u64;
        if requested > 0 {
            if let Some(transfer) = ctx.transfer.as_ref() {
                if let Some(snapshot) =
                    self.registry.take(&partner, &filename, transfer.transfer_id)
                {
                    if snapshot.sync_point == requested {
                        offset = snapshot.offset;
                    }
                }
            }
        }

        let mut source = match self.store.open_read(&filename, offset) {
            Ok(source) => source,
            Err(err) => {
                error!(session = %ctx.session_id, error = %err, "cannot open file for read");
                return self.abort_session(ctx, chan, Diag::OPEN_FAILED);
            }
        };

        if let Some(transfer) = ctx.transfer.as_ref() {
            self.tracker.transfer_started(&partner, transfer);
        }
        let ack = self.file_ack(ctx, FpduType::AckRead, Diag::SUCCESS);
        self.reply(chan, &ack)?;

        // Stream the file straight onto the channel, then close the data
        // phase; the peer answers with TRANS.END.
        let mut writer = ChunkWriter::new(ctx.client_connection_id, max_entity as usize);
        let mut frames = 0u64;
        let mut count = |_chunk: usize, _total: u64| frames += 1;
        let progress = Some(&mut count as &mut dyn FnMut(usize, u64));
        let sent = match writer.write_from_stream(chan, source.as_mut(), progress) {
            Ok(sent) => sent,
            Err(crate::error::SessionError::Transport(err)) => return Err(err.into()),
            Err(crate::error::SessionError::Codec(err)) => return Err(err.into()),
            Err(err) => {
                error!(session = %ctx.session_id, error = %err, "streaming failed");
                return self.abort_session(ctx, chan, Diag::BLOCKING_IO_ERROR);
            }
        };
        if let Some(transfer) = ctx.transfer.as_mut() {
            transfer.bytes_transferred = sent;
            transfer.records_transferred = frames;
        }
        info!(session = %ctx.session_id, filename = %filename, sent, frames, "file streamed");

        let end = Fpdu::new(FpduType::DtfEnd)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(
                Pi::Diagnostic,
                Diag::SUCCESS.to_bytes().to_vec(),
            ));
        self.reply(chan, &end)?;
        ctx.transition_to(ServerState::Tdl02bSending);
        Ok(())
    }

    fn on_trans_end_read(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let (transfer_id, bytes, records) = ctx
            .transfer
            .as_ref()
            .map(|t| (t.transfer_id, t.bytes_transferred, t.records_transferred))
            .unwrap_or((0, 0, 0));
        self.tracker.transfer_completed(transfer_id, bytes, records);
        let ack = self
            .file_ack(ctx, FpduType::AckTransEnd, Diag::SUCCESS)
            .with_param(PiValue::num(Pi::ByteCount, bytes))
            .with_param(PiValue::num(Pi::ArticleCount, records));
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Of02FileOpen);
        Ok(())
    }

    // Messages.

    fn on_msg(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        let filename = fpdu.text(Pi::Filename).unwrap_or_default();
        let body = fpdu
            .param(Pi::Message)
            .map(|p| p.value.clone())
            .unwrap_or_default();
        info!(
            session = %ctx.session_id,
            filename = %filename,
            bytes = body.len(),
            "message received"
        );
        self.tracker.message_received(&partner, &filename, body.len());

        let ack = self
            .file_ack(ctx, FpduType::AckMsg, Diag::SUCCESS)
            .with_param(PiValue::num(
                Pi::TransferId,
                fpdu.num(Pi::TransferId).unwrap_or(0),
            ));
        self.reply(chan, &ack)
    }

    fn on_msgdm(&self, ctx: &mut SessionContext, fpdu: &Fpdu) -> Result<(), EngineError> {
        let filename = fpdu.text(Pi::Filename).unwrap_or_default();
        let mut buffer = MessageBuffer {
            filename,
            data: Vec::new(),
        };
        if let Some(segment) = fpdu.param(Pi::Message) {
            buffer.data.extend_from_slice(&segment.value);
        }
        debug!(
            session = %ctx.session_id,
            filename = %buffer.filename,
            first_segment = buffer.data.len(),
            "segmented message started"
        );
        ctx.message = Some(buffer);
        // No response until the final segment.
        ctx.transition_to(ServerState::MsgReceiving);
        Ok(())
    }

    fn on_msgmm(&self, ctx: &mut SessionContext, fpdu: &Fpdu) -> Result<(), EngineError> {
        if let Some(buffer) = ctx.message.as_mut() {
            if let Some(segment) = fpdu.param(Pi::Message) {
                buffer.data.extend_from_slice(&segment.value);
            }
            debug!(session = %ctx.session_id, total = buffer.data.len(), "message segment");
        }
        Ok(())
    }

    fn on_msgfm(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        let partner = ctx.partner.clone().unwrap_or_default();
        let Some(mut buffer) = ctx.message.take() else {
            return self.abort_session(ctx, chan, Diag::PROTOCOL_ERROR);
        };
        if let Some(segment) = fpdu.param(Pi::Message) {
            buffer.data.extend_from_slice(&segment.value);
        }
        info!(
            session = %ctx.session_id,
            filename = %buffer.filename,
            bytes = buffer.data.len(),
            "segmented message complete"
        );
        self.tracker
            .message_received(&partner, &buffer.filename, buffer.data.len());
        let ack = self.file_ack(ctx, FpduType::AckMsg, Diag::SUCCESS);
        self.reply(chan, &ack)?;
        ctx.transition_to(ServerState::Cn03Connected);
        Ok(())
    }

    // Session teardown.

    fn on_release(
        &self,
        ctx: &mut SessionContext,
        fpdu: &Fpdu,
        chan: &mut dyn TransportChannel,
    ) -> Result<(), EngineError> {
        if let Some(diag) = fpdu.diagnostic() {
            if !diag.is_success() {
                warn!(session = %ctx.session_id, diag = %diag, "release with diagnostic");
            }
        }
        ctx.transfer = None;
        ctx.message = None;
        let confirm = Fpdu::new(FpduType::Relconf)
            .with_id_dst(ctx.client_connection_id)
            .with_id_src(ctx.server_connection_id);
        self.reply(chan, &confirm)?;
        ctx.transition_to(ServerState::Cn01Idle);
        Ok(())
    }

    fn on_abort_received(&self, ctx: &mut SessionContext, fpdu: &Fpdu) {
        error!(
            session = %ctx.session_id,
            diag = ?fpdu.diagnostic(),
            "peer aborted the session"
        );
        ctx.aborted = true;
    }

    /// Answer ABORT with the given diagnostic; the session is terminal.
    fn abort_session(
        &self,
        ctx: &mut SessionContext,
        chan: &mut dyn TransportChannel,
        diag: Diag,
    ) -> Result<(), EngineError> {
        let abort = Fpdu::new(FpduType::Abort)
            .with_id_dst(ctx.client_connection_id)
            .with_id_src(ctx.server_connection_id)
            .with_param(PiValue::new(Pi::Diagnostic, diag.to_bytes().to_vec()));
        self.reply(chan, &abort)?;
        ctx.aborted = true;
        Ok(())
    }

    /// File-level acknowledgments carry the client id as destination and 0
    /// as source.
    fn file_ack(&self, ctx: &SessionContext, kind: FpduType, diag: Diag) -> Fpdu {
        Fpdu::new(kind)
            .with_id_dst(ctx.client_connection_id)
            .with_param(PiValue::new(Pi::Diagnostic, diag.to_bytes().to_vec()))
    }

    fn reply(&self, chan: &mut dyn TransportChannel, fpdu: &Fpdu) -> Result<(), EngineError> {
        let bytes = fpdu.to_bytes()?;
        chan.send(&bytes)?;
        debug!(kind = ?fpdu.kind(), bytes = bytes.len(), "frame sent");
        Ok(())
    }
}

/// Echo the request's file identity, falling back to the bare filename.
fn file_id_group(request: &Fpdu, filename: &str) -> Result<PgiValue, crate::error::CodecError> {
    let file_type = request.num(Pi::FileType).unwrap_or(0);
    PgiValue::new(
        Pgi::FileId,
        vec![
            PiValue::num(Pi::FileType, file_type),
            PiValue::text(Pi::Filename, filename),
        ],
    )
}
