use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ferrite_perf::frame_stream;
use ferrite_wire::{HeartbeatFrame, QuoteFrame, TradeFrame};
use hematite_core::{FrameAssembler, FrameSink};

/// Counts frames and discards them, like a perfectly cheap consumer.
#[derive(Default)]
struct CountingSink {
    frames: u64,
}

impl FrameSink for CountingSink {
    fn on_trade(&mut self, _frame: &TradeFrame) {
        self.frames += 1;
    }

    fn on_quote(&mut self, _frame: &QuoteFrame) {
        self.frames += 1;
    }

    fn on_heartbeat(&mut self, _frame: &HeartbeatFrame) {
        self.frames += 1;
    }
}

fn bench_reassembly(c: &mut Criterion) {
    const FRAMES: u32 = 1000;
    let stream = frame_stream(FRAMES);

    let mut group = c.benchmark_group("assembler");
    group.throughput(Throughput::Elements(FRAMES as u64));

    group.bench_function("whole_stream_1000_frames", |b| {
        b.iter(|| {
            let mut asm = FrameAssembler::new();
            let mut sink = CountingSink::default();
            asm.ingest(black_box(&stream));
            asm.drain(&mut sink);
            black_box(sink.frames)
        });
    });

    group.bench_function("chunked_1400_bytes", |b| {
        b.iter(|| {
            let mut asm = FrameAssembler::new();
            let mut sink = CountingSink::default();
            for chunk in stream.chunks(1400) {
                asm.ingest(black_box(chunk));
                asm.drain(&mut sink);
            }
            black_box(sink.frames)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_reassembly);
criterion_main!(benches);
