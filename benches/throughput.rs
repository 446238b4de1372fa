//! Throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rigcon_core::core::protocol::{crc16_modbus, decode_response, encode_read_request, FunctionCode};
use rigcon_core::core::variables::{parse_expression, VariableContext};

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..256).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("crc16_modbus", |b| b.iter(|| black_box(crc16_modbus(black_box(&data)))));

    group.finish();
}

fn modbus_benchmark(c: &mut Criterion) {
    let mut reply = vec![0x01, 0x03, 0x50];
    for v in 0u16..40 {
        reply.extend_from_slice(&(v * 7).to_be_bytes());
    }
    rigcon_core::core::protocol::append_crc16(&mut reply);

    let mut group = c.benchmark_group("modbus");

    group.bench_function("encode_read", |b| {
        b.iter(|| {
            let frame = encode_read_request(black_box(1), black_box(100), 40, FunctionCode::ReadHoldingRegisters);
            black_box(frame)
        })
    });

    group.throughput(Throughput::Bytes(reply.len() as u64));
    group.bench_function("decode_40_registers", |b| {
        b.iter(|| black_box(decode_response(black_box(&reply), 1)))
    });

    group.finish();
}

fn variables_benchmark(c: &mut Criterion) {
    let mut ctx = VariableContext::new();
    ctx.set("reply", "+CSQ: 23,99");
    ctx.set("min_rssi", 10.0);
    ctx.set("serial", "SN-004211");

    let mut group = c.benchmark_group("variables");

    group.bench_function("parse_condition", |b| {
        b.iter(|| black_box(parse_expression(black_box("number(regex_extract(reply, 'CSQ: (\\d+)')) >= min_rssi"))))
    });

    let parsed = parse_expression("number(regex_extract(reply, 'CSQ: (\\d+)')) >= min_rssi").unwrap();
    group.bench_function("eval_condition", |b| b.iter(|| black_box(parsed.eval_bool(&ctx))));

    group.bench_function("substitute", |b| {
        b.iter(|| black_box(ctx.substitute(black_box("AT+SN=${serial};RSSI>=${min_rssi} ${missing}"))))
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmark, modbus_benchmark, variables_benchmark);
criterion_main!(benches);
