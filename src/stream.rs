//! Isochronous video capture over libusb.
//!
//! Owns the UVC negotiation (probe/commit), the isochronous transfer
//! ring and its completion callback. Payload parsing and frame assembly
//! are delegated to [`crate::uvc::StreamAssembler`]; completed frames
//! leave through the sink installed at start time.
//!
//! Transfer completion callbacks run on the tracker's USB event thread.
//! They never block: payloads are folded into the assembler (an
//! uncontended mutex) and the transfer is resubmitted in place.

use crate::clock::MonotonicClock;
use crate::error::Error;
use crate::pool::{FramePool, PooledFrame};
use crate::uvc::{
    identify_sensor, FrameSink, ProbeCommitControl, SensorModel, StreamAssembler, GET_CUR,
    SET_CUR, STREAM_ENDPOINT, STREAM_INTERFACE, VS_COMMIT_CONTROL, VS_PROBE_CONTROL,
};
use crate::Result;
use crossbeam_channel::{Receiver, TrySendError};
use parking_lot::Mutex;
use rusb::ffi;
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const RESUBMIT_ATTEMPTS: usize = 5;
const RESUBMIT_RETRY_DELAY: Duration = Duration::from_micros(500);

// libusb_transfer_status values.
const TRANSFER_COMPLETED: c_int = 0;
const TRANSFER_CANCELLED: c_int = 3;
const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;

/// State shared with the transfer completion callback.
struct StreamShared {
    running: AtomicBool,
    failed: AtomicBool,
    active_transfers: AtomicUsize,
    packet_size: usize,
    assembler: Mutex<Option<StreamAssembler>>,
}

struct IsoTransfer {
    raw: *mut ffi::libusb_transfer,
    // Owned backing store referenced by `raw`.
    _buffer: Box<[u8]>,
}

// The raw transfer is only touched from this module and the USB event
// thread, with the submit/complete handshake serializing access.
unsafe impl Send for IsoTransfer {}

/// One camera's isochronous video stream.
///
/// `setup` negotiates the format and allocates transfers; `start`
/// populates the frame pool and submits the ring; `stop` drains it.
/// `stop` is safe to call after a failed `start`.
pub struct UvcStream {
    handle: DeviceHandle<Context>,
    model: &'static SensorModel,
    clock: MonotonicClock,
    shared: Arc<StreamShared>,
    transfers: Vec<IsoTransfer>,
    running: bool,
}

impl UvcStream {
    /// Negotiate the video format with an opened camera and allocate the
    /// transfer ring. Enumeration and opening are the caller's business.
    pub fn setup(handle: DeviceHandle<Context>, clock: MonotonicClock) -> Result<UvcStream> {
        let desc = handle.device().device_descriptor()?;
        let model = identify_sensor(desc.vendor_id(), desc.product_id()).ok_or(
            Error::UnknownProduct {
                vid: desc.vendor_id(),
                pid: desc.product_id(),
            },
        )?;

        handle.set_auto_detach_kernel_driver(true)?;
        handle.claim_interface(0)?;
        handle.claim_interface(STREAM_INTERFACE)?;

        negotiate_format(&handle, model)?;
        handle.set_alternate_setting(STREAM_INTERFACE, model.alt_setting)?;

        let (num_transfers, packets_per_transfer) = model.transfer_layout();
        log::info!(
            "{}: {}x{} frames, {} transfers of {} packets of {} bytes",
            model.name,
            model.width,
            model.height,
            num_transfers,
            packets_per_transfer,
            model.packet_size
        );

        let shared = Arc::new(StreamShared {
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            active_transfers: AtomicUsize::new(0),
            packet_size: model.packet_size,
            assembler: Mutex::new(None),
        });

        let mut transfers = Vec::with_capacity(num_transfers);
        for _ in 0..num_transfers {
            transfers.push(alloc_iso_transfer(
                &handle,
                &shared,
                packets_per_transfer,
                model.packet_size,
            )?);
        }

        Ok(UvcStream {
            handle,
            model,
            clock,
            shared,
            transfers,
            running: false,
        })
    }

    pub fn model(&self) -> &'static SensorModel {
        self.model
    }

    /// The underlying device handle, for vendor-specific side channels.
    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// True once the stream gave up resubmitting a transfer.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Allocate `num_frames` pool buffers, install the sink and submit
    /// the transfer ring.
    pub fn start(&mut self, num_frames: usize, sink: FrameSink) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyStreaming);
        }

        let pool = FramePool::new(num_frames, self.model.frame_size());
        *self.shared.assembler.lock() =
            Some(StreamAssembler::new(self.model, pool, self.clock, sink));

        self.shared.failed.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        // Counted before submission: completions may fire immediately.
        self.shared
            .active_transfers
            .store(self.transfers.len(), Ordering::Release);
        self.running = true;

        for (i, transfer) in self.transfers.iter().enumerate() {
            let ret = unsafe { ffi::libusb_submit_transfer(transfer.raw) };
            if ret < 0 {
                log::error!("failed to submit isochronous transfer {}: {}", i, ret);
                // This transfer and the remainder were never in flight.
                let unsubmitted = self.transfers.len() - i;
                self.shared
                    .active_transfers
                    .fetch_sub(unsubmitted, Ordering::AcqRel);
                self.stop();
                return Err(Error::Usb(rusb::Error::Io));
            }
        }

        Ok(())
    }

    /// Stop streaming: cancel the ring, wait for in-flight transfers to
    /// drain, release the frame pool.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Err(e) = self.handle.set_alternate_setting(STREAM_INTERFACE, 0) {
            log::warn!("failed to reset alt setting on stop: {}", e);
        }

        let ctx = self.handle.context().as_raw();
        unsafe {
            ffi::libusb_lock_event_waiters(ctx);
            self.shared.running.store(false, Ordering::Release);
            while self.shared.active_transfers.load(Ordering::Acquire) > 0 {
                if ffi::libusb_wait_for_event(ctx, std::ptr::null_mut()) != 0 {
                    break;
                }
            }
            ffi::libusb_unlock_event_waiters(ctx);
        }

        // Drops the assembler, its in-flight frame and the pool.
        *self.shared.assembler.lock() = None;
    }
}

impl Drop for UvcStream {
    fn drop(&mut self) {
        self.stop();
        for transfer in &self.transfers {
            unsafe { ffi::libusb_free_transfer(transfer.raw) };
        }
    }
}

fn alloc_iso_transfer(
    handle: &DeviceHandle<Context>,
    shared: &Arc<StreamShared>,
    num_packets: usize,
    packet_size: usize,
) -> Result<IsoTransfer> {
    let mut buffer = vec![0u8; num_packets * packet_size].into_boxed_slice();

    let raw = unsafe { ffi::libusb_alloc_transfer(num_packets as c_int) };
    if raw.is_null() {
        return Err(Error::TransferAlloc);
    }

    unsafe {
        (*raw).dev_handle = handle.as_raw();
        (*raw).endpoint = STREAM_ENDPOINT;
        (*raw).transfer_type = TRANSFER_TYPE_ISOCHRONOUS;
        (*raw).timeout = 1000;
        (*raw).buffer = buffer.as_mut_ptr();
        (*raw).length = buffer.len() as c_int;
        (*raw).num_iso_packets = num_packets as c_int;
        (*raw).callback = iso_transfer_done;
        (*raw).user_data = Arc::as_ptr(shared) as *mut c_void;

        let descs =
            std::slice::from_raw_parts_mut((*raw).iso_packet_desc.as_mut_ptr(), num_packets);
        for desc in descs {
            desc.length = packet_size as c_uint;
        }
    }

    Ok(IsoTransfer {
        raw,
        _buffer: buffer,
    })
}

/// Transfer completion: fold the contained packets into the assembler
/// and resubmit, unless the stream is winding down.
extern "system" fn iso_transfer_done(transfer: *mut ffi::libusb_transfer) {
    // The shared block outlives all submitted transfers: stop() drains
    // the ring before UvcStream (and its Arc) can drop.
    let shared = unsafe { &*((*transfer).user_data as *const StreamShared) };
    let status = unsafe { (*transfer).status };

    if status != TRANSFER_COMPLETED {
        if status != TRANSFER_CANCELLED {
            log::warn!("isochronous transfer error: status {}", status);
        }
        shared.active_transfers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    if !shared.running.load(Ordering::Acquire) {
        shared.active_transfers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    {
        let mut guard = shared.assembler.lock();
        if let Some(assembler) = guard.as_mut() {
            let num_packets = unsafe { (*transfer).num_iso_packets } as usize;
            let buffer = unsafe { (*transfer).buffer };
            let descs = unsafe {
                std::slice::from_raw_parts((*transfer).iso_packet_desc.as_ptr(), num_packets)
            };
            for (i, desc) in descs.iter().enumerate() {
                let payload = unsafe {
                    std::slice::from_raw_parts(
                        buffer.add(i * shared.packet_size),
                        desc.actual_length as usize,
                    )
                };
                assembler.process_payload(payload);
            }
        }
    }

    // Resubmission sometimes fails transiently; retry briefly before
    // declaring the stream dead.
    for attempt in 1..=RESUBMIT_ATTEMPTS {
        let ret = unsafe { ffi::libusb_submit_transfer(transfer) };
        if ret >= 0 {
            if attempt > 1 {
                log::info!("resubmitted transfer after {} attempts", attempt);
            }
            return;
        }
        std::thread::sleep(RESUBMIT_RETRY_DELAY);
    }

    log::error!(
        "failed to resubmit transfer after {} attempts, stream failed",
        RESUBMIT_ATTEMPTS
    );
    shared.failed.store(true, Ordering::Release);
    shared.active_transfers.fetch_sub(1, Ordering::AcqRel);
}

/// Bounded queue handing completed frames from the USB event thread to
/// a sensor's vision thread.
///
/// The returned sink never blocks: a full queue drops the frame, which
/// sends its buffer straight back to the pool.
pub fn frame_queue(capacity: usize) -> (FrameSink, Receiver<PooledFrame>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let sink = Box::new(move |frame: PooledFrame| match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            log::trace!("frame queue full, dropping frame");
        }
        Err(TrySendError::Disconnected(_)) => {
            log::debug!("frame queue disconnected, dropping frame");
        }
    });
    (sink, rx)
}

/// Two-phase UVC format negotiation: PROBE with our parameters, read
/// back the device's echo, then COMMIT what it agreed to.
fn negotiate_format(handle: &DeviceHandle<Context>, model: &SensorModel) -> Result<()> {
    let control = model.probe_control();

    video_control_set(handle, VS_PROBE_CONTROL, &control.to_bytes())?;

    let mut echoed = [0u8; ProbeCommitControl::SIZE];
    video_control_get(handle, VS_PROBE_CONTROL, &mut echoed)?;
    let negotiated =
        ProbeCommitControl::from_bytes(&echoed).ok_or(Error::Negotiation("probe"))?;
    log::debug!(
        "negotiated: frame interval {} delay {} frame size {} payload size {}",
        negotiated.frame_interval,
        negotiated.delay,
        negotiated.max_video_frame_size,
        negotiated.max_payload_transfer_size
    );

    video_control_set(handle, VS_COMMIT_CONTROL, &echoed)?;
    Ok(())
}

fn video_control_set(
    handle: &DeviceHandle<Context>,
    selector: u8,
    data: &[u8],
) -> Result<()> {
    let request_type = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
    handle.write_control(
        request_type,
        SET_CUR,
        (selector as u16) << 8,
        STREAM_INTERFACE as u16,
        data,
        CONTROL_TIMEOUT,
    )?;
    Ok(())
}

fn video_control_get(
    handle: &DeviceHandle<Context>,
    selector: u8,
    data: &mut [u8],
) -> Result<usize> {
    let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
    let len = handle.read_control(
        request_type,
        GET_CUR,
        (selector as u16) << 8,
        STREAM_INTERFACE as u16,
        data,
        CONTROL_TIMEOUT,
    )?;
    Ok(len)
}
