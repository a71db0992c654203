//! Fuzz target for inbound packet framing and message parsing.
//!
//! Feeds arbitrary bytes to a plaintext [`PacketReader`] and hands every
//! decoded payload to the message parsers. Looks for panics, unbounded
//! allocation and loops that never drain the buffer.
//!
//! Run with:
//! ```bash
//! cd crates/ssh
//! cargo +nightly fuzz run packet_decode -- -max_total_time=300
//! ```

#![no_main]
use fynx_ssh::connection::{
    ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest,
    GlobalRequest,
};
use fynx_ssh::kex::KexInit;
use fynx_ssh::message::{Disconnect, MessageType};
use fynx_ssh::PacketReader;
use libfuzzer_sys::fuzz_target;

fn parse(payload: &[u8]) {
    let Some(kind) = payload.first().copied().and_then(MessageType::from_u8) else {
        return;
    };
    match kind {
        MessageType::Disconnect => drop(Disconnect::from_bytes(payload)),
        MessageType::KexInit => {
            if let Ok(kexinit) = KexInit::from_bytes(payload) {
                let reparsed = KexInit::from_bytes(&kexinit.to_bytes())
                    .expect("re-encoded KEXINIT must parse");
                assert_eq!(kexinit, reparsed);
            }
        }
        MessageType::GlobalRequest => drop(GlobalRequest::from_bytes(payload)),
        MessageType::ChannelOpen => drop(ChannelOpen::from_bytes(payload)),
        MessageType::ChannelOpenConfirmation => drop(ChannelOpenConfirmation::from_bytes(payload)),
        MessageType::ChannelOpenFailure => drop(ChannelOpenFailure::from_bytes(payload)),
        MessageType::ChannelData | MessageType::ChannelExtendedData => {
            drop(ChannelData::from_bytes(payload))
        }
        MessageType::ChannelRequest => drop(ChannelRequest::from_bytes(payload)),
        _ => {}
    }
}

fuzz_target!(|data: &[u8]| {
    let mut reader = PacketReader::new(());
    reader.feed(data);
    while let Ok(Some(payload)) = reader.decode_buffered() {
        parse(&payload);
    }
});
