use std::time::Duration;

use cadenza_engine::actions::{AddPlugin, CreateTrack, SetTrackProperty, TrackProperty};
use cadenza_engine::model::SlotKind;
use cadenza_engine::{EngineConfig, Session, TrackKind};
use cadenza_plugin_host::builtin;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn session(tracks: usize, block: usize, workers: Option<usize>) -> Session {
    let config = EngineConfig::default()
        .with_block_size(block)
        .with_worker_threads(workers)
        .with_realtime_priority(false)
        .with_deadline_factor(100.0);
    let mut session = Session::open(config).expect("session");
    for index in 0..tracks {
        let track = session
            .submit(CreateTrack::new(TrackKind::Audio, format!("Track {index}")))
            .expect("create track")
            .track()
            .expect("track id");
        session
            .submit(AddPlugin::new(track, SlotKind::Insert, 0, builtin::gain_descriptor()))
            .expect("add plugin");
    }
    session.play().expect("play");
    session
}

fn render_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(30);

    for workers in [Some(0), None] {
        let label = match workers {
            Some(0) => "serial",
            _ => "parallel",
        };
        group.bench_with_input(BenchmarkId::new(label, "48_tracks_block128"), &workers, |b, workers| {
            let mut session = session(48, 128, *workers);
            let mut output = vec![0.0f32; 128 * 2];
            b.iter(|| {
                session.render(&mut output, 128).expect("render");
            });
        });
    }
    group.finish();
}

fn rebuild_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebuild");
    group.sample_size(30);
    group.bench_function("mute_toggle_48_tracks", |b| {
        let mut session = session(48, 256, Some(0));
        let track = session.tracks()[1].id;
        let mut muted = false;
        b.iter(|| {
            muted = !muted;
            session
                .submit(SetTrackProperty::new(track, TrackProperty::Muted(muted)))
                .expect("toggle mute");
        });
    });
    group.bench_function("create_and_undo_track", |b| {
        let mut session = session(48, 256, Some(0));
        b.iter(|| {
            session
                .submit(CreateTrack::new(TrackKind::Audio, "Scratch"))
                .expect("create track");
            session.undo().expect("undo");
        });
    });
    group.finish();
}

criterion_group!(benches, render_blocks, rebuild_graph);
criterion_main!(benches);
