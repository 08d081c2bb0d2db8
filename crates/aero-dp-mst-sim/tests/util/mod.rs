#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aero_dp_mst_sim::sideband::{
    decode_reply, encode_request, I2cWrite, SidebandReply, SidebandRequest,
};
use aero_dp_mst_sim::{
    Guid, HostCallbacks, Limits, SidebandMsg, SimConfig, Simulator, TransferStatus,
};

pub const BRANCH_GUID: Guid = Guid::new([
    0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
]);

pub const REPLY_CAPACITY: usize = 1024;

/// Simulator whose HPD callback bumps the returned counter.
pub fn sim_with_hpd_counter() -> (Simulator, Arc<AtomicUsize>) {
    let hpd = Arc::new(AtomicUsize::new(0));
    let host = HostCallbacks::new(hpd.clone()).on_hpd_irq(|count| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let sim = Simulator::create(SimConfig::with_guid(BRANCH_GUID), host).unwrap();
    (sim, hpd)
}

pub fn hpd_count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// A single 128-byte EDID base block with a valid header and checksum.
pub fn edid_block() -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    // Manufacturer "AER", product 0x0001.
    edid[8] = 0x04;
    edid[9] = 0xB2;
    edid[10] = 0x01;
    for (i, byte) in edid.iter_mut().enumerate().take(127).skip(11) {
        *byte = i as u8;
    }
    let sum = edid[..127].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    edid[127] = 0u8.wrapping_sub(sum);
    edid
}

pub fn edid_read(port: u8, offset: u8, len: u8) -> SidebandRequest {
    SidebandRequest::RemoteI2cRead {
        port,
        writes: vec![I2cWrite {
            device: 0x50,
            bytes: vec![offset],
            no_stop: false,
            delay: 0,
        }],
        read_device: 0x50,
        len,
    }
}

/// Sends every chunk of `request` and decodes the reply carried by the final transfer.
pub fn send(sim: &Simulator, request: &SidebandRequest, seqno: u8) -> SidebandReply {
    let chunks = encode_request(request, seqno, &Limits::default());
    let mut reply = vec![0u8; REPLY_CAPACITY];
    let last = chunks.len() - 1;
    for chunk in &chunks[..last] {
        let mut msg = SidebandMsg::new(chunk, &mut reply);
        assert_eq!(sim.transfer(&mut msg).unwrap(), TransferStatus::Pending);
        assert_eq!(msg.reply_len, 0);
    }
    let mut msg = SidebandMsg::new(&chunks[last], &mut reply);
    assert_eq!(sim.transfer(&mut msg).unwrap(), TransferStatus::Replied);
    let (header, decoded) = decode_reply(msg.reply_bytes()).unwrap();
    assert_eq!(header.seqno, seqno & 1);
    decoded
}
