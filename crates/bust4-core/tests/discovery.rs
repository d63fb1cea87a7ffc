//! End-to-end engine tests against a scripted remote unit.
//!
//! The far end of a duplex pipe plays a gate control unit: it answers
//! the broadcast type probe, reports two commands, serves its menu tree
//! in two pages, and hands out per-command metadata.

use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use bust4_core::engine::{BusClient, EngineConfig};
use bust4_core::protocol::codec::FrameDecoder;
use bust4_core::protocol::message::dmp_message;
use bust4_core::protocol::{Frame, DeviceClass, MessageFlags, Protocol, FRAME_TYPE_NORMAL, SYNC_BYTE};
use bust4_core::protocol::BusAddress;

const UNIT: BusAddress = BusAddress::new(0x01, 0x03);

/// Menu served by the scripted unit: a root placeholder, one group,
/// and two leaf commands below it.
const MENU_PAGE_ONE: &[u8] = &[0x00, 0x00, 0x20, 0x09, 0x10, 0x02];
const MENU_PAGE_TWO: &[u8] = &[0x11, 0x02];

const INFO_0X10: &[u8] = &[0x01, 0x00, 0x05, 0x00];
const INFO_0X11: &[u8] = &[0x01, 0x00, 0x01, 0x40, 0x03, 0x07];

fn respond(request: &Frame) -> Option<Frame> {
    let to = request.to()?;
    if to != UNIT && to != BusAddress::BROADCAST {
        return None;
    }
    if !request.flags()?.is_request() {
        return None;
    }

    let requester = request.from()?;
    let message = match (request.device()?, request.command()?) {
        // Automation type probe; the reply's source teaches the bridge
        // our address.
        (0x04, 0x00) => dmp_message(
            DeviceClass::Controller,
            0x00,
            MessageFlags::from_bits(0x19),
            0,
            0,
            &[0x01],
        ),
        // Command inventory: four type bytes, a count, then the codes.
        (0x04, 0x08) => dmp_message(
            DeviceClass::Controller,
            0x08,
            MessageFlags::from_bits(0x09),
            0,
            0,
            &[0x00, 0x00, 0x00, 0x00, 2, 0x10, 0x11],
        ),
        // Menu pages, selected by the requested resume offset.
        (0x00, 0x10) => match request.sequence()? {
            0 => dmp_message(
                DeviceClass::Standard,
                0x10,
                MessageFlags::from_bits(0x18),
                6,
                0,
                MENU_PAGE_ONE,
            ),
            6 => dmp_message(
                DeviceClass::Standard,
                0x10,
                MessageFlags::from_bits(0x19),
                8,
                0,
                MENU_PAGE_TWO,
            ),
            _ => return None,
        },
        // Per-command metadata; length rides in the sequence byte.
        (0x04, 0x10) => dmp_message(
            DeviceClass::Controller,
            0x10,
            MessageFlags::from_bits(0x09),
            INFO_0X10.len() as u8,
            0,
            INFO_0X10,
        ),
        (0x04, 0x11) => dmp_message(
            DeviceClass::Controller,
            0x11,
            MessageFlags::from_bits(0x09),
            INFO_0X11.len() as u8,
            0,
            INFO_0X11,
        ),
        _ => return None,
    };

    Frame::build(FRAME_TYPE_NORMAL, requester, UNIT, Protocol::Dmp, &message).ok()
}

async fn unit_task(mut stream: DuplexStream) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 64];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if let Some(frame) = decoder.push(byte) {
                if let Some(reply) = respond(&frame) {
                    let mut wire = vec![SYNC_BYTE];
                    wire.extend_from_slice(reply.as_bytes());
                    wire.push(reply.declared_len());
                    if stream.write_all(&wire).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn start() -> BusClient {
    let (near, far) = duplex(1024);
    tokio::spawn(unit_task(far));
    BusClient::spawn(near, EngineConfig::default())
}

async fn wait_for_discovery(client: &BusClient) {
    for _ in 0..500 {
        if client
            .lock_unit(Duration::from_secs(1))
            .await
            .unwrap()
            .discovery_complete()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("discovery did not complete");
}

#[tokio::test]
async fn test_full_discovery() {
    let client = start();
    wait_for_discovery(&client).await;

    let unit = client.lock_unit(Duration::from_secs(1)).await.unwrap();
    assert_eq!(unit.address, UNIT);
    assert_eq!(unit.commands, vec![0x10, 0x11]);

    assert!(unit.menu_complete);
    assert_eq!(unit.menu.len(), 4);
    assert!(unit.menu[0].is_root());
    assert!(unit.menu[1].is_group());
    assert_eq!(unit.menu[1].code(), 0x20);
    assert_eq!(unit.menu[1].depth(), 1);
    assert_eq!(unit.menu[2].code(), 0x10);
    assert_eq!(unit.menu[3].code(), 0x11);
    assert_eq!(unit.menu[3].depth(), 2);

    assert!(unit.command_info_complete);
    let info = unit.command_info(0x10).unwrap();
    assert_eq!(info.value_size(), 1);
    assert_eq!(info.type_selector(), 0x05);
    assert!(!info.is_selection());

    let info = unit.command_info(0x11).unwrap();
    assert!(info.is_selection());
    assert_eq!(info.selection_count(), 3);
    assert_eq!(info.selection_bitmap()[0], 0x07);

    drop(unit);
    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_completes_while_discovery_idles() {
    let client = start();
    wait_for_discovery(&client).await;

    // With nothing left to learn, the discovery task sits in its idle
    // sleep; shutdown must still bring it down promptly.
    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("engine tasks did not stop");
}

#[tokio::test]
async fn test_discovery_stays_idle_once_complete() {
    let client = start();
    wait_for_discovery(&client).await;

    let before = {
        let unit = client.lock_unit(Duration::from_secs(1)).await.unwrap();
        (unit.commands.clone(), unit.menu.clone())
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let unit = client.lock_unit(Duration::from_secs(1)).await.unwrap();
    assert!(unit.discovery_complete());
    assert_eq!((unit.commands.clone(), unit.menu.clone()), before);

    drop(unit);
    client.shutdown().await;
}

#[tokio::test]
async fn test_send_request_alongside_discovery() {
    let client = start();

    // A caller's request shares the correlator with the discovery
    // task; both must get their own replies.
    let frame = Frame::build(
        FRAME_TYPE_NORMAL,
        BusAddress::BROADCAST,
        BusAddress::BRIDGE,
        Protocol::Dmp,
        &dmp_message(
            DeviceClass::Controller,
            0x00,
            MessageFlags::get_request(),
            0,
            0,
            &[],
        ),
    )
    .unwrap();

    let reply = client.send_request(frame, 3).await.unwrap();
    assert_eq!(reply.from(), Some(UNIT));
    assert_eq!(reply.to(), Some(BusAddress::BRIDGE));
    assert_eq!(reply.command(), Some(0x00));

    wait_for_discovery(&client).await;
    client.shutdown().await;
}
