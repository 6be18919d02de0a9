//! Ready-buffer readout: metadata assembly, waveform streaming, buffer
//! clearing, and the cross-board consistency checks.

use crate::device::{Board, Device, Shared};
use crate::error::{DaqError, Result};
use crate::event::{
    approx_trigger_time, next_buffer, sync_problem, BufferMask, Event, EventHeader, Timestamp,
    TriggerType,
};
use crate::spi::Batch;
use padaq_board::bits::{join48, payload24};
use padaq_board::regs::{self, ReadoutMode};
use padaq_board::{Family, NUM_CHUNK, PRETRIGGER_SAMPLE_UNIT, WORD_SIZE};

/// Raw metadata words latched for one board during an event read.
#[derive(Debug, Default)]
struct MetadataWords {
    event_counter: [[u8; 4]; 2],
    trig_counter: [[u8; 4]; 2],
    trig_time: [[u8; 4]; 2],
    deadtime: [u8; 4],
    trig_info: [u8; 4],
    // Master only.
    ch_masks: [u8; 4],
    user_mask: [u8; 4],
    last_beam: [u8; 4],
    beam_power: [u8; 4],
    pps_counter: [u8; 4],
    dyn_mask: [u8; 4],
    veto_deadtime: [u8; 4],
}

impl Shared {
    /// Clear the given buffers and verify their status bits dropped.
    /// Synchronized across both boards when a slave is attached. Returns
    /// whether the clear was acknowledged cleanly.
    pub(crate) fn mark_buffers_done(&mut self, family: Family, mask: BufferMask) -> Result<bool> {
        let clear_word = &family.commands().clear[mask.bits() as usize];

        if self.slave.is_none() {
            let mut status = [0u8; 4];
            let mut batch = Batch::new(&mut *self.master.bus, family);
            batch.write(clear_word)?;
            batch.read_register(family.clear_status_reg(), &mut status)?;
            batch.flush()?;
            drop(batch);
            return Ok(status[3] & mask.bits() == 0);
        }

        let readback =
            self.synchronized_command(family, clear_word, Some(family.clear_status_reg()))?;
        let mut clean = true;
        for (label, word) in [("master", readback.master), ("slave", readback.slave)] {
            if let Some(word) = word {
                if word[3] & mask.bits() != 0 {
                    tracing::warn!(
                        board = label,
                        mask = %mask,
                        after = word[3] & padaq_board::BUF_MASK,
                        "buffer clear not acknowledged (rate too high?)"
                    );
                    clean = false;
                }
            }
        }
        Ok(clean)
    }
}

impl Device {
    /// Read every buffer in `mask` in cursor order, filling one header and
    /// one event record per buffer, and clear each buffer once both boards
    /// have been read.
    ///
    /// Inconsistencies between software bookkeeping and the hardware, or
    /// between master and slave, are recorded in each header's
    /// `sync_problem` bits; the events are still delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the output slices are shorter than the mask
    /// population or on any transfer failure; a failed buffer
    /// short-circuits the read.
    pub fn read_events(
        &self,
        mask: BufferMask,
        headers: &mut [EventHeader],
        events: &mut [Event],
    ) -> Result<usize> {
        let wanted = mask.count() as usize;
        if headers.len() < wanted || events.len() < wanted {
            return Err(DaqError::transfer(format!(
                "need {wanted} header/event records, got {}/{}",
                headers.len(),
                events.len()
            )));
        }

        for (header, event) in headers.iter_mut().zip(events.iter_mut()).take(wanted) {
            let mut sh = self.lock();
            *header = EventHeader::default();

            let mut buffer = sh.next_read_buffer;
            if !mask.contains(buffer) {
                tracing::warn!(
                    cursor = buffer,
                    mask = %mask,
                    hardware_next = sh.hardware_next,
                    "read cursor out of sync with ready mask, resyncing"
                );
                header.sync_problem |= sync_problem::BUFFER_MISMATCH;
                buffer = mask.lowest().unwrap_or(0);
                sh.next_read_buffer = buffer;
            }

            let boards = sh.num_boards();
            for ibd in 0..boards {
                let which = Board::BOTH[ibd];
                if which == Board::Master {
                    // One logical event regardless of board count.
                    sh.event_counter += 1;
                    sh.next_read_buffer = next_buffer(sh.next_read_buffer);
                }
                self.read_board(&mut sh, which, buffer, mask, header, event)?;
            }

            if !sh.mark_buffers_done(self.family, BufferMask::single(buffer))? {
                header.sync_problem |= sync_problem::BUFFER_MISMATCH;
            }
        }

        Ok(wanted)
    }

    /// Read one specific buffer into caller-provided records.
    ///
    /// # Errors
    ///
    /// See [`Self::read_events`].
    pub fn read_single(&self, buffer: u8, header: &mut EventHeader, event: &mut Event) -> Result<()> {
        self.read_events(
            BufferMask::single(buffer),
            std::slice::from_mut(header),
            std::slice::from_mut(event),
        )?;
        Ok(())
    }

    /// Block until events are ready, then read them all.
    ///
    /// # Errors
    ///
    /// See [`Self::wait`] and [`Self::read_events`].
    pub fn wait_and_read(
        &self,
        headers: &mut [EventHeader],
        events: &mut [Event],
    ) -> Result<usize> {
        let mask = self.wait(None)?;
        if mask.is_empty() {
            return Ok(0);
        }
        self.read_events(mask, headers, events)
    }

    /// Clear the given buffers without reading them.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure.
    pub fn clear_buffers(&self, mask: BufferMask) -> Result<()> {
        let mut sh = self.lock();
        sh.mark_buffers_done(self.family, mask)?;
        Ok(())
    }

    /// Stream a raw waveform window (RAM addresses `start..=finish`) for
    /// one buffer and channel into `data`, which must hold
    /// `(finish - start + 1) * 16` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is too short or on transfer failure.
    pub fn read_raw(
        &self,
        buffer: u8,
        channel: u8,
        start: u8,
        finish: u8,
        data: &mut [u8],
        which: Board,
    ) -> Result<()> {
        let naddr = usize::from(finish - start + 1);
        let span = naddr * NUM_CHUNK * WORD_SIZE;
        if data.len() < span {
            return Err(DaqError::transfer(format!(
                "raw window needs {span} bytes, got {}",
                data.len()
            )));
        }

        let family = self.family;
        let commands = family.commands();
        let mut sh = self.lock();
        let io = sh.board_mut(which)?;
        let mut batch = Batch::new(&mut *io.bus, family);
        batch.write(&commands.mode[ReadoutMode::Waveforms.index()])?;
        io.current_mode = Some(ReadoutMode::Waveforms);
        batch.write(&commands.buffer[buffer as usize])?;
        io.current_buf = Some(buffer);
        batch.write(&commands.channel[channel as usize])?;
        append_chunk_reads(&mut batch, family, usize::from(start), &mut data[..span])?;
        batch.flush()
    }

    /// Read one board's metadata and waveforms for one buffer.
    fn read_board(
        &self,
        sh: &mut Shared,
        which: Board,
        buffer: u8,
        mask: BufferMask,
        header: &mut EventHeader,
        event: &mut Event,
    ) -> Result<()> {
        let family = self.family;
        let commands = family.commands();
        let ibd = which.index();
        let now = Timestamp::now();

        let mut md = MetadataWords::default();
        {
            let io = sh.board_mut(which)?;
            let mut batch = Batch::new(&mut *io.bus, family);
            batch.write(&commands.buffer[buffer as usize])?;
            io.current_buf = Some(buffer);

            let (event_counter0, event_counter1) = md.event_counter.split_at_mut(1);
            batch.read_register(regs::EVENT_COUNTER_LOW, &mut event_counter0[0])?;
            batch.read_register(regs::EVENT_COUNTER_HIGH, &mut event_counter1[0])?;
            let (trig_counter0, trig_counter1) = md.trig_counter.split_at_mut(1);
            batch.read_register(regs::TRIG_COUNTER_LOW, &mut trig_counter0[0])?;
            batch.read_register(regs::TRIG_COUNTER_HIGH, &mut trig_counter1[0])?;
            let (trig_time0, trig_time1) = md.trig_time.split_at_mut(1);
            batch.read_register(regs::TRIG_TIME_LOW, &mut trig_time0[0])?;
            batch.read_register(regs::TRIG_TIME_HIGH, &mut trig_time1[0])?;
            batch.read_register(regs::DEADTIME, &mut md.deadtime)?;
            batch.read_register(regs::TRIG_INFO, &mut md.trig_info)?;
            if which == Board::Master {
                // These have no meaning on a slave.
                batch.read_register(regs::CH_MASKS, &mut md.ch_masks)?;
                batch.read_register(regs::USER_MASK, &mut md.user_mask)?;
                batch.read_register(regs::LAST_BEAM, &mut md.last_beam)?;
                batch.read_register(regs::TRIG_BEAM_POWER, &mut md.beam_power)?;
                batch.read_register(regs::PPS_COUNTER, &mut md.pps_counter)?;
                batch.read_register(regs::HD_DYN_MASK, &mut md.dyn_mask)?;
                batch.read_register(regs::VETO_DEADTIME_CTR, &mut md.veto_deadtime)?;
            }
            batch.flush()?;
        }

        let hw_event_counter = join48(
            payload24(&md.event_counter[0]),
            payload24(&md.event_counter[1]),
        );
        let trig_counter = join48(
            payload24(&md.trig_counter[0]),
            payload24(&md.trig_counter[1]),
        );
        let trig_time = join48(payload24(&md.trig_time[0]), payload24(&md.trig_time[1]));
        let tinfo = payload24(&md.trig_info);

        if sh.event_counter != hw_event_counter {
            tracing::warn!(
                board = ?which,
                software = sh.event_counter,
                hardware = hw_event_counter,
                "event counter mismatch"
            );
            header.sync_problem |= sync_problem::BUFFER_MISMATCH;
        }

        let hw_buffer = regs::trig_info::buffer(tinfo);
        if hw_buffer != buffer {
            tracing::warn!(
                board = ?which,
                software = buffer,
                hardware = hw_buffer,
                "buffer number mismatch"
            );
            header.sync_problem |= sync_problem::BUFFER_MISMATCH;
        }

        header.readout_time[ibd] = now.secs;
        header.readout_time_ns[ibd] = now.nanos;
        header.trig_time[ibd] = trig_time;
        header.channel_read_mask[ibd] = sh.channel_read_mask[ibd];
        header.deadtime[ibd] = payload24(&md.deadtime);
        header.board_id[ibd] = sh.board_id[ibd];
        event.board_id[ibd] = sh.board_id[ibd];

        if which == Board::Master {
            let tmask = payload24(&md.ch_masks);
            header.event_number = sh.readout_number_offset + hw_event_counter;
            header.trig_number = trig_counter;
            header.buffer_length = sh.buffer_length;
            header.pretrigger_samples = u16::from(sh.pretrigger) * PRETRIGGER_SAMPLE_UNIT;
            let approx = approx_trigger_time(sh.start_time, trig_time, family.clock_hz());
            header.approx_trigger_time = approx.secs;
            header.approx_trigger_time_ns = approx.nanos;
            header.triggered_beams = payload24(&md.last_beam);
            header.beam_mask = payload24(&md.user_mask);
            header.beam_power = payload24(&md.beam_power);
            header.pps_counter = payload24(&md.pps_counter);
            header.dynamic_beam_mask = payload24(&md.dyn_mask);
            header.veto_deadtime_counter = payload24(&md.veto_deadtime);
            header.buffer_number = hw_buffer;
            header.buffer_mask = mask;
            header.gate_flag = regs::ch_masks::gate(tmask);
            header.channel_mask = regs::ch_masks::channel_mask(tmask);
            header.trig_type = TriggerType::from_bits(regs::trig_info::trig_type(tinfo));
            header.calpulser = regs::trig_info::calpulser(tinfo);
            // The low trig-info bits mirror the polarization register,
            // which saves a separate read.
            header.trig_pol = regs::trig_info::polarization(tinfo);

            event.event_number = header.event_number;
            event.buffer_length = sh.buffer_length;
        } else {
            if header.trig_number != trig_counter {
                tracing::warn!(
                    master = header.trig_number,
                    slave = trig_counter,
                    "trigger number differs between boards"
                );
                header.sync_problem |= sync_problem::TRIG_NUMBER_MISMATCH;
            }
            if header.trig_time[ibd].abs_diff(header.trig_time[0]) > 2 {
                tracing::warn!(
                    master = header.trig_time[0],
                    slave = header.trig_time[ibd],
                    "trigger times differ by more than 2 clock cycles between boards"
                );
                header.sync_problem |= sync_problem::TRIG_TIME_DRIFT;
            }
            if hw_buffer != header.buffer_number {
                tracing::warn!("buffer numbers differ between boards");
                header.sync_problem |= sync_problem::BUFFER_DRIFT;
            }
        }

        // Waveforms: every channel in the read mask, in one batch.
        let read_mask = sh.channel_read_mask[ibd];
        let naddr = usize::from(sh.buffer_length) / (WORD_SIZE * NUM_CHUNK);
        let span = naddr * NUM_CHUNK * WORD_SIZE;
        let io = sh.board_mut(which)?;
        let mut batch = Batch::new(&mut *io.bus, family);
        for (chan, chan_data) in event.data[ibd].iter_mut().enumerate() {
            if read_mask & (1 << chan) == 0 {
                chan_data.fill(0);
                continue;
            }
            if io.current_mode != Some(ReadoutMode::Waveforms) {
                batch.write(&commands.mode[ReadoutMode::Waveforms.index()])?;
                io.current_mode = Some(ReadoutMode::Waveforms);
            }
            if io.current_buf != Some(buffer) {
                batch.write(&commands.buffer[buffer as usize])?;
                io.current_buf = Some(buffer);
            }
            batch.write(&commands.channel[chan])?;
            append_chunk_reads(&mut batch, family, 1, &mut chan_data[..span])?;
        }
        batch.flush()?;
        drop(batch);

        if !sh.has_slave() {
            // No slave: keep its waveform plane zeroed.
            for chan_data in &mut event.data[Board::Slave.index()] {
                chan_data.fill(0);
            }
        }
        Ok(())
    }
}

/// Append the RAM-address / chunk-select / response pattern that streams a
/// waveform window. `data` must be a multiple of one RAM word (16 bytes).
fn append_chunk_reads<'a>(
    batch: &mut Batch<'a>,
    family: Family,
    start_address: usize,
    data: &'a mut [u8],
) -> Result<()> {
    let commands = family.commands();
    debug_assert_eq!(data.len() % (NUM_CHUNK * WORD_SIZE), 0);
    for (i, chunk) in data.chunks_exact_mut(WORD_SIZE).enumerate() {
        if i % NUM_CHUNK == 0 {
            batch.write(&commands.ram_addr[start_address + i / NUM_CHUNK])?;
        }
        batch.write(&commands.chunk[i % NUM_CHUNK])?;
        if family.prompted_read() {
            batch.write(&padaq_board::cmd::READ_PROMPT)?;
        }
        let word = <&mut [u8; WORD_SIZE]>::try_from(chunk)
            .expect("chunks_exact yields word-sized slices");
        batch.append(None, Some(word))?;
    }
    Ok(())
}
