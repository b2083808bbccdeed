//! wpflash-core: Windows Phone / Qualcomm firmware servicing in Rust.
//!
//! This crate implements the image formats and wire protocols needed to
//! inspect, patch, and flash Lumia-era Qualcomm devices.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **FFU**: Full Flash Update container parsing and partition access
//! - **GPT**: partition table model with manifest-driven merging
//! - **UEFI**: firmware volume parsing and in-place module patching
//! - **Patcher**: ARM bootloader binary patches
//! - **Patchdefs**: declarative SHA-1-verified file patching
//! - **Protocol**: transports and engines (Sahara, DLOAD, streaming
//!   flasher, Firehose, Lumia NOK*)
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use wpflash_core::ffu::FfuImage;
//!
//! let image = FfuImage::open("RM984_flash.ffu").expect("open failed");
//! println!("platform: {}", image.platform_id());
//! for partition in &image.gpt().expect("no GPT").partitions {
//!     println!("  {}", partition.name);
//! }
//! ```

pub mod bytes;
pub mod events;
pub mod ffu;
pub mod gpt;
pub mod patchdefs;
pub mod patcher;
pub mod protocol;
pub mod uefi;

// Re-exports for convenience
pub use events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use ffu::{FfuError, FfuImage};
pub use gpt::{Gpt, GptError, Partition};
pub use patchdefs::{PatchEngine, PatchError, PatchOutcome};
pub use patcher::PatcherError;
pub use protocol::{MockTransport, ProtocolError, RawTransport, TransportError};
pub use uefi::{UefiError, UefiImage};
