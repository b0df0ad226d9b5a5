//! USB plumbing for FTDI chips: vendor control requests and raw bulk
//! transfers on one MPSSE interface.

mod error;
pub use error::FtdiError;
use crate::{Interface, mpsse::Link};
use futures_lite::future::{block_on, or};
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use smol::Timer;
use std::{future::Future, time::Duration};

/// Upper bound for every USB transfer.
pub const USB_TIMEOUT: Duration = Duration::from_millis(1000);

#[repr(C)]
#[expect(unused)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BitMode {
    Reset = 0,
    Bitbang = 1,
    Mpsse = 2,
    SyncBb = 4,
    Mcu = 8,
    Opto = 16,
    Cbus = 32,
    SyncFf = 64,
    Ft1284 = 128,
}

/// An opened and claimed FTDI interface.
pub struct FtdiContext {
    /// USB device handle
    handle: nusb::Interface,
    /// FTDI device interface
    interface_index: u16,
    write_ep: u8,
    read_ep: u8,
    max_packet_size: usize,
}

fn with_timeout<T>(transfer: impl Future<Output = Result<T, FtdiError>>) -> Result<T, FtdiError> {
    block_on(or(transfer, async {
        Timer::after(USB_TIMEOUT).await;
        Err(FtdiError::Timeout)
    }))
}

impl FtdiContext {
    pub(crate) fn new(
        handle: nusb::Interface,
        interface: Interface,
        max_packet_size: usize,
    ) -> Self {
        Self {
            handle,
            interface_index: interface.index(),
            write_ep: interface.write_ep(),
            read_ep: interface.read_ep(),
            max_packet_size,
        }
    }
    /// Reset the chip, flush both FIFOs and switch it to MPSSE mode.
    pub(crate) fn into_mpsse(mut self, mask: u8) -> Result<Self, FtdiError> {
        self.usb_reset()?;
        self.usb_purge_buffers()?;
        self.set_event_char(None)?;
        self.set_error_char(None)?;
        self.set_latency_timer(16)?;
        self.set_bitmode(0, BitMode::Reset)?;
        self.set_bitmode(mask, BitMode::Mpsse)?;
        Ok(self)
    }
    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), FtdiError> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.interface_index,
                },
                &[],
                USB_TIMEOUT,
            )
            .map_err(std::io::Error::from)?;

        Ok(())
    }

    fn usb_reset(&mut self) -> Result<(), FtdiError> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_SIO: u16 = 0;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    /// Clears the write buffer on the chip.
    fn usb_purge_tx_buffer(&mut self) -> Result<(), FtdiError> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_PURGE_TX: u16 = 2;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)
    }

    fn usb_purge_rx_buffer(&mut self) -> Result<(), FtdiError> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_PURGE_RX: u16 = 1;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)
    }

    fn usb_purge_buffers(&mut self) -> Result<(), FtdiError> {
        self.usb_purge_tx_buffer()?;
        self.usb_purge_rx_buffer()?;

        Ok(())
    }

    /// `None` disables the special character.
    fn set_event_char(&mut self, event: Option<u8>) -> Result<(), FtdiError> {
        const SIO_SET_EVENT_CHAR_REQUEST: u8 = 0x06;

        let value = event.map_or(0, |c| 0x100 | c as u16);
        self.sio_write(SIO_SET_EVENT_CHAR_REQUEST, value)
    }

    fn set_error_char(&mut self, error: Option<u8>) -> Result<(), FtdiError> {
        const SIO_SET_ERROR_CHAR_REQUEST: u8 = 0x07;

        let value = error.map_or(0, |c| 0x100 | c as u16);
        self.sio_write(SIO_SET_ERROR_CHAR_REQUEST, value)
    }

    fn set_latency_timer(&mut self, value: u8) -> Result<(), FtdiError> {
        const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;

        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, value as u16)
    }

    fn set_bitmode(&mut self, bitmask: u8, mode: BitMode) -> Result<(), FtdiError> {
        const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([bitmask, mode as u8]),
        )
    }
}

impl Link for FtdiContext {
    fn write(&mut self, data: &[u8]) -> Result<(), FtdiError> {
        log::trace!("tx {:02x?}", data);
        with_timeout(async {
            self.handle
                .bulk_out(self.write_ep, Vec::from(data))
                .await
                .into_result()
                .map_err(std::io::Error::from)?;
            Ok(())
        })
    }

    fn read(&mut self) -> Result<Vec<u8>, FtdiError> {
        let packet = with_timeout(async {
            let packet = self
                .handle
                .bulk_in(self.read_ep, RequestBuffer::new(self.max_packet_size))
                .await
                .into_result()
                .map_err(std::io::Error::from)?;
            Ok(packet)
        })?;
        log::trace!("rx {:02x?}", packet);
        Ok(packet)
    }

    fn packet_size(&self) -> usize {
        self.max_packet_size
    }
}
