//! Benchmark for block device discovery parsing
//!
//! A large host lists a few hundred block devices; parsing must stay well
//! under the cost of spawning lsblk itself.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sata_device_plugin::hardware::discovery::{parse_block_devices, LsblkDiscovery};

fn lsblk_document(disks: usize) -> String {
    let mut records = Vec::with_capacity(disks);
    for i in 0..disks {
        let name = format!("sd{}{}", (b'a' + (i / 26) as u8) as char, (b'a' + (i % 26) as u8) as char);
        if i % 3 == 0 {
            records.push(format!(
                r#"{{"name": "{name}", "size": "1.8T", "children": [{{"name": "{name}1", "size": "1.8T"}}]}}"#
            ));
        } else {
            records.push(format!(r#"{{"name": "{name}", "size": "1.8T"}}"#));
        }
    }
    format!(r#"{{"blockdevices": [{}]}}"#, records.join(","))
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");

    for disks in [4usize, 64, 256] {
        let data = lsblk_document(disks);
        group.throughput(Throughput::Elements(disks as u64));

        group.bench_function(format!("parse_block_devices/{}", disks), |b| {
            b.iter(|| {
                let _ = parse_block_devices(black_box(&data), "blockdevices", "/dev/");
            });
        });
    }

    group.finish();
}

fn bench_discover_from_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");
    let discovery = LsblkDiscovery::default();
    let data = lsblk_document(256);
    group.throughput(Throughput::Elements(256));

    group.bench_function("discover_from_output/256", |b| {
        b.iter(|| {
            let _ = discovery.discover_from_output(black_box(&data));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_discover_from_output);
criterion_main!(benches);
