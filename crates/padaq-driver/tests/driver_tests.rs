//! Driver scenarios against the simulated board model: wire sequences,
//! wait semantics, readout bookkeeping, and the reset/alignment paths.

use padaq_board::cmd;
use padaq_driver::sim::{SimBoard, SimHandle, WireLog};
use padaq_driver::{
    Board, BufferMask, DaqError, Device, Event, EventHeader, Family, Options, ResetLevel,
};
use std::time::{Duration, Instant};

fn fast_options(family: Family) -> Options {
    let mut options = Options::for_family(family);
    options.poll_interval_us = 100;
    options.reset_settle = Duration::from_millis(1);
    options.adc_settle = Duration::from_millis(1);
    options.trigger_wait = Duration::from_millis(250);
    options
}

fn single_board(family: Family) -> (Device, SimHandle, WireLog) {
    let log = WireLog::new();
    let master = SimBoard::new(family, "M", true, &log);
    let handle = master.handle();
    let device = Device::from_buses(Box::new(master), None, None, None, fast_options(family))
        .expect("open single-board device");
    log.clear();
    (device, handle, log)
}

fn dual_board() -> (Device, SimHandle, SimHandle, WireLog) {
    let log = WireLog::new();
    let master = SimBoard::new(Family::Bn, "M", true, &log);
    let slave = SimBoard::new(Family::Bn, "S", false, &log);
    let master_handle = master.handle();
    let slave_handle = slave.handle();
    let device = Device::from_buses(
        Box::new(master),
        Some(Box::new(slave)),
        None,
        None,
        fast_options(Family::Bn),
    )
    .expect("open dual-board device");
    log.clear();
    (device, master_handle, slave_handle, log)
}

fn records(n: usize) -> (Vec<EventHeader>, Vec<Event>) {
    (vec![EventHeader::default(); n], vec![Event::default(); n])
}

// ── Synchronized-command wire order ──────────────────────────────────────

#[test]
fn synchronized_command_wire_sequence() {
    let (device, _m, _s, log) = dual_board();
    device.sw_trigger().unwrap();
    assert_eq!(
        log.take(),
        vec![
            ("M", cmd::SYNC_ON),
            ("S", cmd::FORCE_TRIGGER),
            ("M", cmd::FORCE_TRIGGER),
            ("M", cmd::SYNC_OFF),
        ]
    );
}

#[test]
fn single_board_command_is_direct() {
    let (device, _handle, log) = single_board(Family::Bn);
    device.sw_trigger().unwrap();
    assert_eq!(log.take(), vec![("M", cmd::FORCE_TRIGGER)]);
}

// ── Wait semantics ───────────────────────────────────────────────────────

#[test]
fn wait_times_out_with_empty_mask() {
    let (device, _handle, _log) = single_board(Family::Bn);
    let mask = device.wait(Some(Duration::from_millis(10))).unwrap();
    assert!(mask.is_empty());
}

#[test]
fn wait_sees_buffer_that_becomes_ready() {
    let (device, handle, _log) = single_board(Family::Bn);
    handle.make_ready_after(Duration::from_millis(10), 0);
    let started = Instant::now();
    let mask = device.wait(Some(Duration::from_millis(500))).unwrap();
    assert_eq!(mask.bits(), 0x1);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn cancel_before_wait_returns_cancelled() {
    let (device, _handle, _log) = single_board(Family::Bn);
    device.cancel_wait();
    assert!(matches!(device.wait(None), Err(DaqError::Cancelled)));
    // The cancellation was consumed; the next wait runs normally.
    let mask = device.wait(Some(Duration::from_millis(5))).unwrap();
    assert!(mask.is_empty());
}

#[test]
fn cancel_during_wait_returns_interrupted() {
    let (device, _handle, _log) = single_board(Family::Bn);
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| device.wait(None));
        std::thread::sleep(Duration::from_millis(50));
        device.cancel_wait();
        let result = waiter.join().expect("waiter thread");
        assert!(matches!(result, Err(DaqError::Interrupted)));
    });
}

#[test]
fn second_concurrent_waiter_is_busy() {
    let (device, handle, _log) = single_board(Family::Bn);
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| device.wait(Some(Duration::from_millis(500))));
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            device.wait(Some(Duration::from_millis(5))),
            Err(DaqError::Busy)
        ));
        // The first waiter is undisturbed and still sees its buffer.
        handle.make_ready_after(Duration::from_millis(1), 0);
        let result = waiter.join().expect("waiter thread").unwrap();
        assert_eq!(result.bits(), 0x1);
    });
}

// ── Event readout ────────────────────────────────────────────────────────

#[test]
fn event_counter_tracks_hardware_across_reads() {
    let (device, handle, _log) = single_board(Family::Bn);
    for _ in 0..3 {
        device.sw_trigger().unwrap();
    }
    assert_eq!(handle.event_counter(), 3);

    let mask = device.check_buffers(Board::Master).unwrap();
    assert_eq!(mask.bits(), 0b111);
    let (mut headers, mut events) = records(3);
    let n = device.read_events(mask, &mut headers, &mut events).unwrap();
    assert_eq!(n, 3);
    assert_eq!(device.event_counter(), 3);
    for (i, header) in headers.iter().enumerate() {
        assert_eq!(header.sync_problem, 0, "header {i} flagged");
        assert_eq!(header.buffer_number, i as u8);
    }
    // All three buffers were cleared on the way out.
    assert_eq!(handle.ready_mask(), 0);
    // Waveforms carry the board's deterministic fill pattern.
    let expected = |chan: usize, i: usize| ((16 + i + chan) % 251) as u8;
    assert_eq!(events[0].data[0][0][0], expected(0, 0));
    assert_eq!(events[0].data[0][3][100], expected(3, 100));
    assert_eq!(events[0].buffer_length, device.buffer_length());
}

#[test]
fn unread_channels_are_zero_filled() {
    let (device, _handle, _log) = single_board(Family::Bn);
    device.set_channel_read_mask(Board::Master, 0x01);
    device.sw_trigger().unwrap();
    let (mut headers, mut events) = records(1);
    device
        .read_events(BufferMask::single(0), &mut headers, &mut events)
        .unwrap();
    assert_eq!(headers[0].channel_read_mask[0], 0x01);
    assert!(events[0].data[0][1].iter().all(|&s| s == 0));
    assert!(events[0].data[0][0].iter().any(|&s| s != 0));
    // No slave attached: its plane stays zeroed.
    assert!(events[0].data[1][0].iter().all(|&s| s == 0));
}

#[test]
fn cursor_resync_is_flagged_but_event_delivered() {
    let (device, _handle, _log) = single_board(Family::Bn);
    for _ in 0..3 {
        device.sw_trigger().unwrap();
    }
    // Cursor points at buffer 0; reading buffer 2 alone forces a resync.
    let mut header = EventHeader::default();
    let mut event = Event::boxed();
    device.read_single(2, &mut header, &mut event).unwrap();
    assert_ne!(header.sync_problem & padaq_driver::sync_problem::BUFFER_MISMATCH, 0);
    assert_eq!(header.buffer_number, 2);
}

#[test]
fn trig_time_drift_between_boards_sets_flag() {
    let (device, _m, slave, _log) = dual_board();
    slave.set_trig_time_offset(3);
    device.sw_trigger().unwrap();

    let (mut headers, mut events) = records(1);
    let n = device
        .read_events(BufferMask::single(0), &mut headers, &mut events)
        .unwrap();
    assert_eq!(n, 1);
    let header = &headers[0];
    assert_eq!(header.trig_time[1], header.trig_time[0] + 3);
    assert_ne!(header.sync_problem & padaq_driver::sync_problem::TRIG_TIME_DRIFT, 0);
    // Counters and buffer numbers still agree.
    assert_eq!(header.sync_problem & padaq_driver::sync_problem::TRIG_NUMBER_MISMATCH, 0);
    assert_eq!(header.sync_problem & padaq_driver::sync_problem::BUFFER_DRIFT, 0);
}

#[test]
fn drift_within_two_clocks_is_clean() {
    let (device, _m, slave, _log) = dual_board();
    slave.set_trig_time_offset(2);
    device.sw_trigger().unwrap();
    let (mut headers, mut events) = records(1);
    device
        .read_events(BufferMask::single(0), &mut headers, &mut events)
        .unwrap();
    assert_eq!(headers[0].sync_problem, 0);
}

#[test]
fn trigger_time_projects_onto_wall_clock() {
    let (device, handle, _log) = single_board(Family::Bn);
    handle.push_trig_time(0x0112_3456);
    device.sw_trigger().unwrap();

    let (mut headers, mut events) = records(1);
    device
        .read_events(BufferMask::single(0), &mut headers, &mut events)
        .unwrap();
    let header = &headers[0];
    assert_eq!(header.trig_time[0], 0x0112_3456);

    // 0x1123456 clocks at 500 MHz / 16 is 575_048_384 ns past the anchor.
    let start = device.start_time();
    let mut expected_secs = start.secs;
    let mut expected_ns = u64::from(start.nanos) + 575_048_384;
    if expected_ns >= 1_000_000_000 {
        expected_secs += 1;
        expected_ns -= 1_000_000_000;
    }
    assert_eq!(header.approx_trigger_time, expected_secs);
    assert_eq!(u64::from(header.approx_trigger_time_ns), expected_ns);
}

// ── Configuration readback ───────────────────────────────────────────────

#[test]
fn thresholds_write_and_read_back_clamped() {
    let (device, _handle, _log) = single_board(Family::Bn);
    let mut wanted: Vec<u32> = (0..20).map(|i| 100 * (i + 1)).collect();
    wanted[7] = 0x12_3456;
    wanted[19] = 0xfff_ffff; // clamps to 20 bits
    device.set_thresholds(&wanted).unwrap();

    let got = device.thresholds().unwrap();
    assert_eq!(got.len(), 20);
    for (i, (&w, &g)) in wanted.iter().zip(got.iter()).enumerate() {
        assert_eq!(g, w.min(0xf_ffff), "beam {i}");
    }
}

#[test]
fn channel_mask_reads_back() {
    let (device, _handle, _log) = single_board(Family::Bn);
    device.set_channel_mask(0xab).unwrap();
    assert_eq!(device.channel_mask().unwrap(), 0x00ab);
}

#[test]
fn attenuation_roundtrips_through_bit_reversal() {
    let (device, _handle, _log) = single_board(Family::Bn);
    let levels = [0x01, 0x3f, 0x2a, 0x15, 0x00, 0x07, 0x38, 0x1c];
    device.set_attenuation(Some(&levels), None).unwrap();
    assert_eq!(device.attenuation(Board::Master).unwrap(), levels);
}

#[test]
fn extended_config_is_rejected_on_np() {
    let (device, _handle, _log) = single_board(Family::Np);
    assert!(matches!(
        device.set_attenuation(Some(&[0; 8]), None),
        Err(DaqError::Unsupported { .. })
    ));
    assert!(matches!(
        device.trigger_polarization(),
        Err(DaqError::Unsupported { .. })
    ));
}

#[test]
fn np_register_reads_use_the_prompt_word() {
    let (device, _handle, log) = single_board(Family::Np);
    device.read_register(0x10, Board::Master).unwrap();
    let words: Vec<_> = log.take().into_iter().map(|(_, w)| w).collect();
    assert_eq!(
        words,
        vec![
            [Family::Np.set_read_reg(), 0, 0, 0x10],
            [padaq_board::regs::READ, 0, 0, 0],
        ]
    );
}

#[test]
fn fwinfo_assembles_dna_from_halves() {
    let (device, _handle, _log) = single_board(Family::Bn);
    let info = device.fwinfo(Board::Master).unwrap();
    assert!(info.version.master);
    assert_eq!(info.version.major, 4);
    assert_eq!(info.version.minor, 2);
    assert_eq!(info.dna, 0x8877_6655_4433_2211);
}

#[test]
fn status_snapshot_unpacks_scalers() {
    let (device, handle, _log) = single_board(Family::Bn);
    let flat: Vec<u16> = (0..63).collect();
    handle.set_scalers(&flat);
    let status = device.read_status(Board::Master).unwrap();
    // Category 0: global then beams 0..19.
    assert_eq!(status.global_scalers[0], 0);
    assert_eq!(status.beam_scalers[0][0], 1);
    assert_eq!(status.beam_scalers[0][19], 20);
    // Category 1 starts at flat index 21.
    assert_eq!(status.global_scalers[1], 21);
    assert_eq!(status.beam_scalers[1][5], 27);
    assert_eq!(status.global_scalers[2], 42);
}

// ── Reset & calibration ──────────────────────────────────────────────────

#[test]
fn counters_reset_sequence_and_anchor() {
    let (device, _handle, log) = single_board(Family::Bn);
    let before = padaq_driver::Timestamp::now();
    device.reset(ResetLevel::Counters).unwrap();
    let after = padaq_driver::Timestamp::now();

    let words: Vec<_> = log.take().into_iter().map(|(_, w)| w).collect();
    assert_eq!(
        words,
        vec![
            cmd::phased_trigger_word(false),
            cmd::CLEAR_ALL_BUFFERS,
            cmd::CLEAR_RING,
            cmd::TIMESTAMP_FREE_RUN,
            cmd::RESET_COUNTER,
        ]
    );
    assert_eq!(device.event_counter(), 0);
    let anchor = device.start_time();
    assert!(anchor.secs >= before.secs && anchor.secs <= after.secs);
}

#[test]
fn global_reset_synchronizes_and_resets_counters_last() {
    let (device, _m, _s, log) = dual_board();
    device.reset(ResetLevel::Global).unwrap();
    let words = log.take();
    assert_eq!(
        words[..4],
        [
            ("M", cmd::SYNC_ON),
            ("S", cmd::RESET_ALL),
            ("M", cmd::RESET_ALL),
            ("M", cmd::SYNC_OFF),
        ]
    );
    assert_eq!(
        words[words.len() - 4..],
        [
            ("M", cmd::SYNC_ON),
            ("S", cmd::RESET_COUNTER),
            ("M", cmd::RESET_COUNTER),
            ("M", cmd::SYNC_OFF),
        ]
    );
}

#[test]
fn alignment_converges_and_writes_pair_delays() {
    let (device, handle, _log) = single_board(Family::Bn);
    handle.set_peaks([100, 102, 100, 104, 100, 102, 100, 104]);
    handle.set_peak_amplitude(60);

    device.reset(ResetLevel::Calibrate).unwrap();

    assert_eq!(handle.clk_resets(), 0, "converged without a clock reset");
    assert_eq!(
        handle.adc_delay_writes(),
        vec![(0, 1), (1, 2), (2, 1), (3, 2)]
    );
    // Cleanup restored the buffer length and left the pulser off.
    assert_eq!(device.buffer_length(), padaq_board::DEFAULT_BUFFER_LENGTH);
}

#[test]
fn alignment_retries_after_a_clock_reset() {
    let (device, handle, _log) = single_board(Family::Bn);
    // First attempt: peaks too far apart; good after one clock reset.
    handle.set_peaks([100, 140, 100, 100, 100, 100, 100, 100]);
    handle.push_peaks_after_clk_reset([100; 8]);

    device.reset(ResetLevel::Calibrate).unwrap();
    assert_eq!(handle.clk_resets(), 1);
    // Perfectly aligned peaks need no delay writes.
    assert!(handle.adc_delay_writes().is_empty());
}

#[test]
fn alignment_gives_up_on_weak_pulses() {
    let (device, handle, _log) = single_board(Family::Bn);
    handle.set_peak_amplitude(5); // below the acceptance floor
    let result = device.reset(ResetLevel::Calibrate);
    assert!(matches!(result, Err(DaqError::CalibrationFailed { .. })));
    // The pulser is off again even after a failure.
    let (mut headers, mut events) = records(1);
    device.sw_trigger().unwrap();
    let mask = device.check_buffers(Board::Master).unwrap();
    device.read_events(mask, &mut headers, &mut events).unwrap();
    assert!(!headers[0].calpulser);
}
