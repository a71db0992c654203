//! Packet framing benchmarks.
//!
//! Measures sealing and opening binary packets with the plaintext framing
//! used before the first key exchange and with a keyed cipher and MAC.
//!
//! Run with: `cargo bench -p fynx-ssh --bench framing`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fynx_ssh::algorithm::CipherMode;
use fynx_ssh::{AlgorithmRegistry, PacketReader, PacketWriter};

const PAYLOAD_SIZES: [usize; 4] = [64, 1024, 8192, 16384];

/// Writer and reader keyed with the same `cipher` and `mac`.
fn keyed_pair(cipher: &str, mac: &str) -> (PacketWriter<()>, PacketReader<()>) {
    let registry = AlgorithmRegistry::with_defaults();
    let mut writer = PacketWriter::new(());
    let mut reader = PacketReader::new(());

    let keys = |mode| {
        let mut c = registry.cipher(cipher).unwrap();
        let key = vec![0x42u8; c.key_size()];
        let iv = vec![0x24u8; c.iv_size()];
        c.init(mode, &key, &iv).unwrap();
        let mut m = registry.mac(mac).unwrap();
        m.init(&vec![0x17u8; m.key_size()]).unwrap();
        (c, Some(m))
    };

    let (c, m) = keys(CipherMode::Encrypt);
    writer.set_keys(c, m);
    let (c, m) = keys(CipherMode::Decrypt);
    reader.set_keys(c, m);
    (writer, reader)
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal");
    for size in PAYLOAD_SIZES {
        let payload = vec![94u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        let mut plain = PacketWriter::new(());
        group.bench_with_input(BenchmarkId::new("none", size), &payload, |b, p| {
            b.iter(|| plain.seal(black_box(p)).unwrap())
        });

        let (mut keyed, _) = keyed_pair("aes128-ctr", "hmac-sha2-256");
        group.bench_with_input(
            BenchmarkId::new("aes128-ctr+hmac-sha2-256", size),
            &payload,
            |b, p| b.iter(|| keyed.seal(black_box(p)).unwrap()),
        );
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_and_open");
    for (cipher, mac) in [("aes128-ctr", "hmac-sha1"), ("aes256-ctr", "hmac-sha2-512")] {
        for size in PAYLOAD_SIZES {
            let payload = vec![94u8; size];
            group.throughput(Throughput::Bytes(size as u64));

            let (mut writer, mut reader) = keyed_pair(cipher, mac);
            let id = format!("{}+{}", cipher, mac);
            group.bench_with_input(BenchmarkId::new(id, size), &payload, |b, p| {
                b.iter(|| {
                    let frame = writer.seal(black_box(p)).unwrap();
                    reader.feed(&frame);
                    reader.decode_buffered().unwrap().unwrap()
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_seal, bench_round_trip);
criterion_main!(benches);
