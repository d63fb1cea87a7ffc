//! Capability discovery
//!
//! Background task that interrogates the remote unit one round-trip at
//! a time: learn its address via broadcast, fetch the command
//! inventory, page through the menu tree, then pull metadata for each
//! menu command. Progress accumulates in the shared [`RemoteUnit`]
//! model; the lock is held across a whole round-trip so readers see
//! each step applied atomically. A timed-out probe is simply attempted
//! again on the next pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::correlator::Correlator;
use super::model::{MenuRecord, RemoteUnit};
use crate::protocol::address::BusAddress;
use crate::protocol::frame::Frame;
use crate::protocol::message::{dmp_message, DeviceClass, MessageFlags, Protocol};
use crate::protocol::{ProtocolError, FRAME_TYPE_NORMAL};

/// Controller command reporting the automation type; any unit answers,
/// which makes it the address-learning broadcast probe.
const CMD_UNIT_TYPE: u8 = 0x00;
/// Controller command listing the supported command codes.
const CMD_COMMAND_LIST: u8 = 0x08;
/// Standard-device command paging through the menu tree.
const CMD_MENU: u8 = 0x10;

/// Incremental discovery driver; cheap to clone, all state is shared.
#[derive(Clone)]
pub(crate) struct Discovery {
    correlator: Arc<Correlator>,
    unit: Arc<Mutex<RemoteUnit>>,
    idle_poll: Duration,
}

impl Discovery {
    pub(crate) fn new(
        correlator: Arc<Correlator>,
        unit: Arc<Mutex<RemoteUnit>>,
        idle_poll: Duration,
    ) -> Self {
        Self {
            correlator,
            unit,
            idle_poll,
        }
    }

    /// Drive discovery until the link goes away. Once the model is
    /// complete the loop keeps polling at a slow cadence so a unit
    /// swapped on the bus is eventually re-learned.
    pub(crate) async fn run(self) {
        loop {
            match self.step().await {
                Ok(true) => tokio::time::sleep(self.idle_poll).await,
                Ok(false) => {}
                Err(ProtocolError::LinkClosed) => break,
                Err(e) => {
                    warn!(error = %e, "discovery step failed");
                }
            }
        }
        debug!("discovery task stopped");
    }

    /// Perform at most one discovery round-trip. Returns true when the
    /// model is complete and there was nothing to do.
    async fn step(&self) -> Result<bool, ProtocolError> {
        let mut unit = self.unit.lock().await;

        if !unit.has_address() {
            self.probe_address(&mut unit).await?;
        } else if unit.commands.is_empty() {
            self.fetch_commands(&mut unit).await?;
        } else if !unit.menu_complete {
            self.fetch_menu_page(&mut unit).await?;
        } else if !unit.command_info_complete {
            self.fetch_command_info(&mut unit).await?;
        } else {
            return Ok(true);
        }

        Ok(false)
    }

    /// One-attempt request; a timeout is not an error, just no progress.
    async fn roundtrip(&self, to: BusAddress, message: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        let frame = Frame::build(
            FRAME_TYPE_NORMAL,
            to,
            BusAddress::BRIDGE,
            Protocol::Dmp,
            message,
        )?;
        match self.correlator.request(frame, 0).await {
            Ok(reply) => Ok(Some(reply)),
            Err(ProtocolError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Broadcast the unit-type probe and adopt the responder's address.
    async fn probe_address(&self, unit: &mut RemoteUnit) -> Result<(), ProtocolError> {
        let message = dmp_message(
            DeviceClass::Controller,
            CMD_UNIT_TYPE,
            MessageFlags::get_request(),
            0,
            0,
            &[],
        );
        if let Some(reply) = self.roundtrip(BusAddress::BROADCAST, &message).await? {
            if let Some(from) = reply.from() {
                info!(address = %from, "unit discovered");
                unit.address = from;
            }
        }
        Ok(())
    }

    /// Ask the unit for its command inventory.
    async fn fetch_commands(&self, unit: &mut RemoteUnit) -> Result<(), ProtocolError> {
        let message = dmp_message(
            DeviceClass::Controller,
            CMD_COMMAND_LIST,
            MessageFlags::info_request(),
            0,
            0,
            &[],
        );
        if let Some(reply) = self.roundtrip(unit.address, &message).await? {
            let payload = reply.dmp_payload();
            let parsed = payload
                .get(4)
                .map(|&count| count as usize)
                .and_then(|count| payload.get(5..5 + count));
            match parsed {
                Some(codes) if !codes.is_empty() => {
                    info!(count = codes.len(), "command inventory received");
                    unit.commands = codes.to_vec();
                }
                _ => warn!(len = payload.len(), "malformed command inventory reply"),
            }
        }
        Ok(())
    }

    /// Request the next menu page, starting where the stored tree ends.
    /// Replies carry a run of big-endian records plus, in the sequence
    /// byte, the index just past the run; the final page sets the FINAL
    /// flag.
    async fn fetch_menu_page(&self, unit: &mut RemoteUnit) -> Result<(), ProtocolError> {
        let message = dmp_message(
            DeviceClass::Standard,
            CMD_MENU,
            MessageFlags::get_request(),
            (unit.menu.len() * 2) as u8,
            0x01,
            &[0x04],
        );
        let Some(reply) = self.roundtrip(unit.address, &message).await? else {
            return Ok(());
        };

        let run_len = reply
            .message_size()
            .map(|s| (s.saturating_sub(6) / 2) as usize)
            .unwrap_or(0);
        let last = reply.sequence().map(|s| (s / 2) as usize).unwrap_or(0);
        let payload = reply.dmp_payload();

        let first = match last.checked_sub(run_len) {
            Some(first) if payload.len() >= run_len * 2 => first,
            _ => {
                warn!(run_len, last, "malformed menu page reply");
                return Ok(());
            }
        };

        if unit.menu.len() < last {
            unit.menu.resize(last, MenuRecord::default());
        }
        for n in 0..run_len {
            let record = u16::from_be_bytes([payload[2 * n], payload[2 * n + 1]]);
            unit.menu[first + n] = MenuRecord(record);
        }

        if reply.flags().is_some_and(|f| f.is_final()) {
            info!(entries = unit.menu.len(), "menu tree complete");
            unit.menu_complete = true;
        }
        Ok(())
    }

    /// Fetch metadata for the first menu command still lacking it, one
    /// per pass. With nothing left to fetch, mark the model complete.
    async fn fetch_command_info(&self, unit: &mut RemoteUnit) -> Result<(), ProtocolError> {
        let Some(code) = unit.next_missing_command_info() else {
            info!(
                commands = unit.command_info.len(),
                "command metadata complete"
            );
            unit.command_info_complete = true;
            return Ok(());
        };

        let message = dmp_message(
            DeviceClass::Controller,
            code,
            MessageFlags::info_request(),
            0,
            0,
            &[],
        );
        if let Some(reply) = self.roundtrip(unit.address, &message).await? {
            // The sequence byte carries the metadata length.
            let size = reply.sequence().unwrap_or(0) as usize;
            let payload = reply.dmp_payload();
            let blob = payload[..size.min(payload.len())].to_vec();
            if let Some(command) = reply.command() {
                debug!(command, len = blob.len(), "command metadata received");
                unit.insert_command_info(command, blob);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const UNIT_ADDRESS: BusAddress = BusAddress::new(0x01, 0x03);

    struct Fixture {
        discovery: Discovery,
        correlator: Arc<Correlator>,
        unit: Arc<Mutex<RemoteUnit>>,
        outbound_rx: mpsc::Receiver<Frame>,
    }

    fn fixture() -> Fixture {
        let (tx, outbound_rx) = mpsc::channel(8);
        let correlator = Arc::new(Correlator::new(tx, Duration::from_millis(500)));
        let unit = Arc::new(Mutex::new(RemoteUnit::new()));
        let discovery = Discovery::new(correlator.clone(), unit.clone(), Duration::from_secs(1));
        Fixture {
            discovery,
            correlator,
            unit,
            outbound_rx,
        }
    }

    fn reply(device: DeviceClass, command: u8, flags: u8, sequence: u8, payload: &[u8]) -> Frame {
        Frame::build(
            FRAME_TYPE_NORMAL,
            BusAddress::BRIDGE,
            UNIT_ADDRESS,
            Protocol::Dmp,
            &dmp_message(
                device,
                command,
                MessageFlags::from_bits(flags),
                sequence,
                0,
                payload,
            ),
        )
        .unwrap()
    }

    /// Run one discovery step, answering its request with the given
    /// reply. Returns the request that was transmitted.
    async fn step_with_reply(fx: &mut Fixture, reply: Frame) -> Frame {
        let d = fx.discovery.clone();
        let handle = tokio::spawn(async move { d.step().await });
        let request = fx.outbound_rx.recv().await.unwrap();
        assert!(fx.correlator.complete(&reply));
        assert!(!handle.await.unwrap().unwrap());
        request
    }

    #[tokio::test]
    async fn test_address_probe() {
        let mut fx = fixture();
        let request = step_with_reply(
            &mut fx,
            reply(DeviceClass::Controller, CMD_UNIT_TYPE, 0x19, 0, &[0x01]),
        )
        .await;

        assert_eq!(request.to(), Some(BusAddress::BROADCAST));
        assert_eq!(request.from(), Some(BusAddress::BRIDGE));
        assert_eq!(request.device(), Some(0x04));
        assert_eq!(request.command(), Some(CMD_UNIT_TYPE));
        assert_eq!(request.flags().map(|f| f.bits()), Some(0x99));

        assert_eq!(fx.unit.lock().await.address, UNIT_ADDRESS);
    }

    #[tokio::test]
    async fn test_command_inventory() {
        let mut fx = fixture();
        fx.unit.lock().await.address = UNIT_ADDRESS;

        // Payload: four bytes of type info, a count, then the codes.
        let request = step_with_reply(
            &mut fx,
            reply(
                DeviceClass::Controller,
                CMD_COMMAND_LIST,
                0x09,
                0,
                &[0, 0, 0, 0, 3, 0x10, 0x11, 0x42],
            ),
        )
        .await;

        assert_eq!(request.to(), Some(UNIT_ADDRESS));
        assert_eq!(request.flags().map(|f| f.bits()), Some(0x89));

        assert_eq!(fx.unit.lock().await.commands, vec![0x10, 0x11, 0x42]);
    }

    #[tokio::test]
    async fn test_menu_paging() {
        let mut fx = fixture();
        {
            let mut unit = fx.unit.lock().await;
            unit.address = UNIT_ADDRESS;
            unit.commands = vec![0x10];
        }

        // First page: three records ending at index 3, not final.
        // sequence = 2 * last index, message carries 3 BE records.
        let request = step_with_reply(
            &mut fx,
            reply(
                DeviceClass::Standard,
                CMD_MENU,
                0x18,
                6,
                &[0x00, 0x00, 0x20, 0x09, 0x10, 0x02],
            ),
        )
        .await;
        assert_eq!(request.sequence(), Some(0)); // asked from the start
        assert_eq!(request.dmp_payload(), &[0x04]);

        {
            let unit = fx.unit.lock().await;
            assert_eq!(unit.menu.len(), 3);
            assert!(unit.menu[0].is_root());
            assert!(unit.menu[1].is_group());
            assert_eq!(unit.menu[1].code(), 0x20);
            assert_eq!(unit.menu[2].code(), 0x10);
            assert_eq!(unit.menu[2].depth(), 2);
            assert!(!unit.menu_complete);
        }

        // Second page: one record at index 3, final.
        let request = step_with_reply(
            &mut fx,
            reply(DeviceClass::Standard, CMD_MENU, 0x19, 8, &[0x11, 0x02]),
        )
        .await;
        assert_eq!(request.sequence(), Some(6)); // resume past 3 records

        let unit = fx.unit.lock().await;
        assert_eq!(unit.menu.len(), 4);
        assert_eq!(unit.menu[3].code(), 0x11);
        assert!(unit.menu_complete);
    }

    #[tokio::test]
    async fn test_menu_page_shorter_than_stored_keeps_entries() {
        let mut fx = fixture();
        {
            let mut unit = fx.unit.lock().await;
            unit.address = UNIT_ADDRESS;
            unit.commands = vec![0x10];
            unit.menu = vec![
                MenuRecord::default(),
                MenuRecord::new(0x20, 1, true),
                MenuRecord::new(0x10, 2, false),
                MenuRecord::new(0x11, 2, false),
            ];
        }

        // Stale reply declaring a final index below what is already
        // stored: the run is applied but no learned records are lost.
        step_with_reply(
            &mut fx,
            reply(DeviceClass::Standard, CMD_MENU, 0x18, 2, &[0x30, 0x01]),
        )
        .await;

        let unit = fx.unit.lock().await;
        assert_eq!(unit.menu.len(), 4);
        assert_eq!(unit.menu[0].code(), 0x30);
        assert_eq!(unit.menu[3].code(), 0x11);
        assert!(!unit.menu_complete);
    }

    #[tokio::test]
    async fn test_command_metadata() {
        let mut fx = fixture();
        {
            let mut unit = fx.unit.lock().await;
            unit.address = UNIT_ADDRESS;
            unit.commands = vec![0x10];
            unit.menu = vec![
                MenuRecord::default(),
                MenuRecord::new(0x20, 1, true),
                MenuRecord::new(0x10, 2, false),
            ];
            unit.menu_complete = true;
        }

        // Metadata length rides in the sequence byte.
        let request = step_with_reply(
            &mut fx,
            reply(
                DeviceClass::Controller,
                0x10,
                0x09,
                4,
                &[0x02, 0x00, 0x05, 0x10, 0xFF],
            ),
        )
        .await;
        assert_eq!(request.command(), Some(0x10));
        assert_eq!(request.flags().map(|f| f.bits()), Some(0x89));

        let unit = fx.unit.lock().await;
        let blob = unit.command_info.get(&0x10).unwrap();
        // Truncated to the declared 4 bytes, then zero-padded.
        assert_eq!(&blob[..5], &[0x02, 0x00, 0x05, 0x10, 0x00]);
        assert!(!unit.command_info_complete);
    }

    #[tokio::test]
    async fn test_metadata_completion_and_idle() {
        let fx = fixture();
        {
            let mut unit = fx.unit.lock().await;
            unit.address = UNIT_ADDRESS;
            unit.commands = vec![0x10];
            unit.menu = vec![MenuRecord::new(0x10, 1, false)];
            unit.menu_complete = true;
            unit.insert_command_info(0x10, vec![0x02]);
        }

        // Everything fetched: this pass only flips the completion flag.
        assert!(!fx.discovery.step().await.unwrap());
        assert!(fx.unit.lock().await.command_info_complete);

        // And from here on the step is idle.
        assert!(fx.discovery.step().await.unwrap());
        assert!(fx.unit.lock().await.discovery_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_fatal() {
        let mut fx = fixture();

        let d = fx.discovery.clone();
        let handle = tokio::spawn(async move { d.step().await });
        // Swallow the probe and let it time out.
        fx.outbound_rx.recv().await.unwrap();
        assert!(!handle.await.unwrap().unwrap());
        assert!(!fx.unit.lock().await.has_address());
    }
}
