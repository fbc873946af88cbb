//! Boot-time configuration from internal flash.
//!
//! The last 8KB of the 512KB part hold one record with the three config
//! blobs (`motor`, `servo`, `servopos`), a magic/version header and a CRC32
//! over everything before the checksum.  The record is provisioned out of
//! band (debug probe or factory tooling); a valid one is applied on boot and
//! the derived constants recomputed.

use embassy_stm32::flash::{Blocking, Flash};

use servo::config::{Config, Motor, PositionConfig};
use servo::hal::{ClockedRegisters, MotorDriver, PositionSensor};
use servo::servo::Servo;

/// "SRVO" in ASCII.
const CONFIG_MAGIC: u32 = 0x5352564F;
const CONFIG_VERSION: u8 = 1;
/// Flash offset of the config region (last 8KB of 512KB).
const CONFIG_OFFSET: u32 = 0x7E000;

/// CRC32 lookup table (IEEE 802.3 polynomial)
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ (byte as u32)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[repr(C)]
#[derive(Clone)]
pub struct StoredConfig {
    pub magic: u32,
    pub version: u8,

    pub motor: Motor,
    pub servo: Config,
    pub servopos: PositionConfig,

    /// CRC32 over the record, must stay the last field.
    pub crc: u32,
}

const STORED_SIZE: usize = core::mem::size_of::<StoredConfig>();

impl StoredConfig {
    /// Size of data before CRC field
    const DATA_SIZE: usize = STORED_SIZE - 4;

    fn as_bytes(&self) -> [u8; STORED_SIZE] {
        unsafe { core::mem::transmute_copy(self) }
    }

    fn from_bytes(bytes: &[u8; STORED_SIZE]) -> Self {
        unsafe { core::mem::transmute_copy(bytes) }
    }

    fn compute_crc(&self) -> u32 {
        let bytes = self.as_bytes();
        crc32(&bytes[..Self::DATA_SIZE])
    }

    pub fn is_valid(&self) -> bool {
        self.magic == CONFIG_MAGIC
            && self.version == CONFIG_VERSION
            && self.crc == self.compute_crc()
    }
}

/// Read the stored record.  Returns None when no valid record exists.
pub fn read_config(flash: &mut Flash<'_, Blocking>) -> Option<StoredConfig> {
    let mut buffer = [0u8; STORED_SIZE];
    if flash.blocking_read(CONFIG_OFFSET, &mut buffer).is_err() {
        return None;
    }

    let config = StoredConfig::from_bytes(&buffer);
    if config.is_valid() {
        Some(config)
    } else {
        None
    }
}

/// Apply a stored record to the controller and refresh what derives from it.
pub fn apply_to_servo<R, S, D>(servo: &mut Servo<R, S, D>, stored: &StoredConfig)
where
    R: ClockedRegisters,
    S: PositionSensor,
    D: MotorDriver,
{
    *servo.motor_mut() = stored.motor.clone();
    *servo.config_mut() = stored.servo.clone();
    *servo.position_config_mut() = stored.servopos;
    servo.update_config();
}
