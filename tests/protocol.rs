//! End-to-end capture protocol tests against the virtual board.

use std::sync::Arc;
use std::time::Duration;

use artemis::error::{ConfigError, StreamError};
use artemis::pipeline::stages::LUT_LEN;
use artemis::virt::{EpochPump, VirtHw, VirtProfile, FRONT_END_IRQ, WRITER_IRQ};
use artemis::{
    BufferState, CaptureStream, HandoverFlags, PixelFormat, StreamConfig, StreamPhase,
};

fn make_stream(
    profile: VirtProfile,
    tweak: impl FnOnce(&mut StreamConfig),
) -> (VirtHw, Arc<CaptureStream>) {
    let hw = VirtHw::new(profile);
    let mut config = StreamConfig::default();
    // Keep the negotiation and teardown polls instant under test.
    config.tuning.status_retry_delay_ms = 0;
    config.tuning.stop_poll_delay_ms = 0;
    config.tuning.snapshot_settle_ms = 0;
    tweak(&mut config);
    let stream = CaptureStream::new(config, &hw.descriptor(), hw.pipeline_hw())
        .expect("stream construction");
    (hw, Arc::new(stream))
}

fn journal_index(journal: &[String], needle: &str) -> usize {
    journal
        .iter()
        .position(|e| e.contains(needle))
        .unwrap_or_else(|| panic!("journal has no entry containing {needle:?}: {journal:#?}"))
}

fn journal_rindex(journal: &[String], needle: &str) -> usize {
    journal.len()
        - 1
        - journal
            .iter()
            .rev()
            .position(|e| e.contains(needle))
            .unwrap_or_else(|| panic!("journal has no entry containing {needle:?}"))
}

#[test]
fn full_cycle_finalizes_every_buffer_exactly_once() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    assert_eq!(stream.request_buffers(4).unwrap(), 4);
    for i in 0..4 {
        stream.enqueue_buffer(i).unwrap();
    }
    stream.start_streaming().unwrap();

    // Progressive source: one warm-up epoch, then one capture per epoch
    // while at least two buffers remain queued.
    for _ in 0..6 {
        hw.drive_epoch(&stream, false);
    }

    let mut done = Vec::new();
    while let Ok(frame) = stream.dequeue_buffer(false) {
        done.push(frame);
    }
    assert_eq!(done.len(), 3, "three captures before the queue runs dry");
    for (expected_seq, frame) in done.iter().enumerate() {
        assert_eq!(frame.state, BufferState::Done);
        assert_eq!(frame.sequence, expected_seq as u32);
    }
    assert_eq!(
        done.iter().map(|f| f.index).collect::<Vec<_>>(),
        [0, 1, 2],
        "buffers finalize in queue order"
    );

    // The last buffer is the degenerate single-buffer case: staged but
    // never finalized until stop fails it back.
    stream.stop_streaming().unwrap();
    let aborted = stream.dequeue_buffer(false).unwrap();
    assert_eq!((aborted.index, aborted.state), (3, BufferState::Error));
    assert!(matches!(
        stream.dequeue_buffer(false),
        Err(StreamError::WouldBlock)
    ));
    assert_eq!(stream.queued(), 0);

    let stats = stream.stats();
    assert_eq!(stats.captured, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errored, 1);
    stream.close();
}

#[test]
fn start_requests_interrupts_only_after_resets() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.start_streaming().unwrap();

    let journal = hw.journal();
    let last_reset = journal_rindex(&journal, ".reset_release");
    let first_irq = journal_index(&journal, "irq.request");
    assert!(
        last_reset < first_irq,
        "interrupts must not go live before the resets settle"
    );
    // Bring-up order across the big steps.
    assert!(journal_index(&journal, "source.power(true)") < journal_index(&journal, "clock.enable"));
    assert!(journal_index(&journal, "clock.enable") < journal_rindex(&journal, ".reset_assert"));
    assert!(first_irq < journal_index(&journal, "fe.configure"));
    assert!(journal_index(&journal, "fe.configure") < journal_index(&journal, "writer.configure"));

    assert!(hw.clock_on());
    assert!(hw.irq_requested(FRONT_END_IRQ));
    assert!(hw.irq_requested(WRITER_IRQ));
    assert!(hw.source_powered());
    assert!(hw.source_streaming());
    assert!(hw.stage_enabled(artemis::StageId::FrontEnd));
    assert_eq!(stream.phase(), StreamPhase::Streaming);
}

#[test]
fn stop_runs_every_teardown_step_in_order() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.start_streaming().unwrap();
    hw.drive_epoch(&stream, false);
    stream.stop_streaming().unwrap();

    let journal = hw.journal();
    let wr_off = journal_rindex(&journal, "writer.disable");
    let fe_off = journal_rindex(&journal, "fe.disable");
    let irq_clear = journal_index(&journal, "irq.clear");
    let irq_free = journal_index(&journal, "irq.free");
    let clock_off = journal_index(&journal, "clock.disable");
    let source_off = journal_index(&journal, "source.stream(false)");

    assert!(wr_off < fe_off, "writer quiesces before the front-end stops");
    assert!(fe_off < irq_clear && irq_clear < irq_free);
    assert!(irq_free < clock_off);
    assert!(clock_off < source_off, "the source is stopped last");

    assert!(!hw.clock_on());
    assert!(!hw.irq_requested(FRONT_END_IRQ));
    assert!(!hw.irq_requested(WRITER_IRQ));
    assert!(!hw.source_streaming());
    assert!(!hw.stage_enabled(artemis::StageId::FrontEnd));
    assert_eq!(stream.phase(), StreamPhase::Idle);
}

#[test]
fn interlaced_source_warms_up_before_arming() {
    let (hw, stream) = make_stream(VirtProfile::interlaced(720, 576), |_| {});
    stream.open().unwrap();
    stream.request_buffers(4).unwrap();
    for i in 0..4 {
        stream.enqueue_buffer(i).unwrap();
    }
    stream.start_streaming().unwrap();
    assert!(stream.source_info().interlaced);

    // The deinterlacer joined the pipeline.
    let journal = hw.journal();
    journal_index(&journal, "di.configure");
    journal_index(&journal, "di.plug_in");

    // Default warm-up is five epochs; none of them touches the queue.
    for _ in 0..5 {
        hw.drive_epoch(&stream, false);
        assert!(matches!(
            stream.dequeue_buffer(false),
            Err(StreamError::WouldBlock)
        ));
        assert_eq!(stream.queued(), 4);
    }
    assert_eq!(stream.stats().skipped, 5);

    // Epoch six arms the next buffer and its completion finalizes the
    // first frame.
    hw.drive_epoch(&stream, false);
    let first = stream.dequeue_buffer(false).unwrap();
    assert_eq!((first.index, first.sequence), (0, 0));

    stream.stop_streaming().unwrap();
    let journal = hw.journal();
    journal_index(&journal, "di.plug_out");
}

#[test]
fn progressive_source_leaves_the_deinterlacer_unplugged() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.start_streaming().unwrap();
    stream.stop_streaming().unwrap();

    let journal = hw.journal();
    assert!(!journal.iter().any(|e| e.contains("di.plug_in")));
    assert!(!journal.iter().any(|e| e.contains("di.plug_out")));
}

#[test]
fn handover_flags_skip_inherited_pieces() {
    let (hw, stream) = make_stream(VirtProfile::default(), |cfg| {
        cfg.handover = HandoverFlags::SOURCE_RUNNING.union(HandoverFlags::DEVICE_RUNNING);
    });
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.start_streaming().unwrap();

    let journal = hw.journal();
    assert!(!journal.iter().any(|e| e.contains("source.power")));
    assert!(!journal.iter().any(|e| e.contains(".reset_assert")));
    // Interrupts are still ours to own.
    journal_index(&journal, "irq.request");

    stream.stop_streaming().unwrap();
    let journal = hw.journal();
    assert!(!journal.iter().any(|e| e.contains("clock.disable")));
    assert!(!journal.iter().any(|e| e.contains("source.stream(false)")));
}

#[test]
fn stop_with_queued_buffers_fails_them_all_back() {
    let (_hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(4).unwrap();
    for i in 0..3 {
        stream.enqueue_buffer(i).unwrap();
    }
    stream.start_streaming().unwrap();
    stream.stop_streaming().unwrap();

    let mut returned = Vec::new();
    while let Ok(frame) = stream.dequeue_buffer(false) {
        assert_eq!(frame.state, BufferState::Error);
        returned.push(frame.index);
    }
    returned.sort_unstable();
    assert_eq!(returned, [0, 1, 2]);
    assert_eq!(stream.queued(), 0);
}

#[test]
fn disconnect_fails_buffers_immediately() {
    let (_hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.enqueue_buffer(0).unwrap();
    stream.set_disconnected();

    // The queued buffer came back in error when the device vanished.
    let frame = stream.dequeue_buffer(false).unwrap();
    assert_eq!((frame.index, frame.state), (0, BufferState::Error));

    // New submissions bounce straight to the completion path.
    stream.enqueue_buffer(1).unwrap();
    let frame = stream.dequeue_buffer(false).unwrap();
    assert_eq!((frame.index, frame.state), (1, BufferState::Error));

    assert!(matches!(
        stream.start_streaming(),
        Err(StreamError::Disconnected)
    ));
}

#[test]
fn format_negotiation_round_trips_and_rejects_mid_transfer() {
    let (_hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();

    let tried = stream.try_format(PixelFormat::Nv12, 640, 480).unwrap();
    let set = stream.set_format(PixelFormat::Nv12, 640, 480).unwrap();
    assert_eq!(tried, set);
    assert_eq!(stream.format(), set);

    assert!(matches!(
        stream.set_format(PixelFormat::Yuyv, 0, 480),
        Err(StreamError::Config(ConfigError::InvalidSize { .. }))
    ));

    stream.request_buffers(2).unwrap();
    stream.enqueue_buffer(0).unwrap();
    assert!(matches!(
        stream.set_format(PixelFormat::Yuyv, 640, 480),
        Err(StreamError::Busy(_))
    ));

    stream.start_streaming().unwrap();
    assert!(matches!(
        stream.set_format(PixelFormat::Yuyv, 640, 480),
        Err(StreamError::Busy(_))
    ));
    stream.stop_streaming().unwrap();
}

#[test]
fn lut_payload_length_is_enforced() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();

    assert!(matches!(
        stream.load_lut(&[0u8; 16]),
        Err(StreamError::Config(ConfigError::BadLutLength { .. }))
    ));
    assert!(hw.loaded_lut().is_none());

    stream.load_lut(&vec![0xabu8; LUT_LEN]).unwrap();
    let lut = hw.loaded_lut().expect("lut reached the front-end");
    assert_eq!(lut.len(), LUT_LEN);
}

#[test]
fn snapshot_redirects_and_restores_the_writer() {
    let (hw, stream) = make_stream(VirtProfile::default(), |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.enqueue_buffer(0).unwrap();
    stream.enqueue_buffer(1).unwrap();
    stream.start_streaming().unwrap();

    // Warm-up epoch, then the arming epoch: buffer 0 (armed at start) is
    // latched, buffer 1 sits in the shadow register.
    hw.drive_epoch(&stream, false);
    hw.drive_epoch(&stream, false);
    let first = stream.query_buffer(0).unwrap().planes.base();
    let armed = stream.query_buffer(1).unwrap().planes.base();
    assert_eq!(hw.latched_address(), first);
    assert_eq!(hw.armed_address(), armed);

    assert!(stream.last_frame().is_none());
    let snap = stream.snapshot_last_frame().unwrap();
    assert_eq!(snap, StreamConfig::default().snapshot_base);
    assert_eq!(stream.last_frame().unwrap().address, snap);
    // The capture protocol owns the register again.
    assert_eq!(hw.armed_address(), armed);

    stream.stop_streaming().unwrap();
}

#[test]
fn transport_liveness_tracks_writer_progress() {
    let (hw, stream) = make_stream(VirtProfile::default(), |cfg| {
        cfg.tuning.liveness_interval_ms = 5;
    });
    stream.open().unwrap();
    stream.request_buffers(4).unwrap();
    for i in 0..4 {
        stream.enqueue_buffer(i).unwrap();
    }
    stream.start_streaming().unwrap();

    // Keep the queue fed so the writer keeps making progress.
    let recycler = {
        let stream = stream.clone();
        let completions = stream.completions();
        std::thread::spawn(move || {
            while let Ok(frame) = completions.recv_timeout(Duration::from_millis(250)) {
                if frame.state == BufferState::Done {
                    let _ = stream.enqueue_buffer(frame.index);
                }
            }
        })
    };
    let pump = EpochPump::spawn(hw.clone(), stream.clone(), Duration::from_millis(2)).unwrap();
    assert!(stream.transport_alive().unwrap());
    pump.stop();

    stream.stop_streaming().unwrap();
    assert!(!stream.transport_alive().unwrap(), "no progress after stop");
    recycler.join().unwrap();
}

#[test]
fn missing_interrupt_line_degrades_start_but_still_streams() {
    let hw = VirtHw::new(VirtProfile::default());
    let mut desc = hw.descriptor();
    desc.writer.irq = None;
    let mut config = StreamConfig::default();
    config.tuning.status_retry_delay_ms = 0;
    let stream = CaptureStream::new(config, &desc, hw.pipeline_hw()).unwrap();

    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    match stream.start_streaming() {
        Err(StreamError::StartDegraded(failed)) => assert!(failed >= 1),
        other => panic!("expected degraded start, got {other:?}"),
    }
    assert_eq!(stream.phase(), StreamPhase::Streaming);
    stream.stop_streaming().unwrap();
}

#[test]
fn held_writer_makes_stop_degraded_but_total() {
    let profile = VirtProfile { hold_frame_complete: true, ..Default::default() };
    let (hw, stream) = make_stream(profile, |_| {});
    stream.open().unwrap();
    stream.request_buffers(2).unwrap();
    stream.start_streaming().unwrap();

    match stream.stop_streaming() {
        Err(StreamError::StopDegraded(failed)) => assert!(failed >= 1),
        other => panic!("expected degraded stop, got {other:?}"),
    }
    // Teardown still ran to the end.
    let journal = hw.journal();
    assert!(journal.iter().any(|e| e.contains("source.stream(false)")));
    assert!(!hw.clock_on());
    assert_eq!(stream.phase(), StreamPhase::Idle);
}

#[test]
fn corrupted_epochs_are_dropped_in_drop_corrupted_mode() {
    let (hw, stream) = make_stream(VirtProfile::default(), |cfg| {
        cfg.drop_corrupted = true;
    });
    stream.open().unwrap();
    stream.request_buffers(3).unwrap();
    for i in 0..3 {
        stream.enqueue_buffer(i).unwrap();
    }
    stream.start_streaming().unwrap();

    hw.drive_epoch(&stream, false); // warm-up
    hw.drive_epoch(&stream, true); // corrupted: stages but never arms
    assert!(matches!(
        stream.dequeue_buffer(false),
        Err(StreamError::WouldBlock)
    ));

    // A clean epoch afterwards captures normally.
    hw.drive_epoch(&stream, false);
    let frame = stream.dequeue_buffer(false).unwrap();
    assert_eq!((frame.index, frame.state), (0, BufferState::Done));
    stream.stop_streaming().unwrap();
}
