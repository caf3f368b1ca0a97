use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

// RTC seconds are counted in master-clock cycles fed from the CPU step.
const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

/// Failure to construct a cartridge from an image.
#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("unsupported cartridge type {0:#04x}")]
    UnsupportedMbc(u8),
    #[error("ROM image truncated: {0} bytes is smaller than the header")]
    Truncated(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

/// Per-variant mapper latches. Tagged variants rather than trait objects: the
/// set is closed and the dispatch sites want to see the whole register file.
#[derive(Debug)]
enum MbcState {
    NoMbc,
    Mbc1 {
        /// 5-bit ROM bank select; 0 is stored as 1.
        primary_bank: u8,
        /// 2-bit upper ROM bank bits, or the RAM bank in advanced mode.
        secondary_bank: u8,
        /// 0 = simple banking, 1 = advanced banking.
        mode: u8,
        ram_enable: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }
}

/// MBC3 real-time clock, driven from the CPU clock rather than wall time.
/// Persisting and resynchronizing the clock across runs is host policy.
#[derive(Debug, Default)]
struct Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    subsecond_cycles: u32,
}

impl Rtc {
    fn latch(&mut self) {
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds & 0x3F,
            0x09 => self.latched.minutes & 0x3F,
            0x0A => self.latched.hours & 0x1F,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                // A seconds write restarts the current second.
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        // Register writes are immediately visible through the latched view.
        self.latch();
    }

    fn step(&mut self, cycles: u32) {
        if self.regs.halt {
            return;
        }
        self.subsecond_cycles += cycles;
        while self.subsecond_cycles >= RTC_CYCLES_PER_SECOND {
            self.subsecond_cycles -= RTC_CYCLES_PER_SECOND;
            self.tick_second();
        }
    }

    fn tick_second(&mut self) {
        self.regs.seconds = self.regs.seconds.wrapping_add(1) & 0x3F;
        if self.regs.seconds != 60 {
            return;
        }
        self.regs.seconds = 0;
        self.regs.minutes = self.regs.minutes.wrapping_add(1) & 0x3F;
        if self.regs.minutes != 60 {
            return;
        }
        self.regs.minutes = 0;
        self.regs.hours = self.regs.hours.wrapping_add(1) & 0x1F;
        if self.regs.hours != 24 {
            return;
        }
        self.regs.hours = 0;
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days += 1;
        }
    }
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub title: String,
    cart_type: u8,
    /// Bank count declared by the header; bank selects wrap modulo this.
    rom_bank_count: usize,
    save_path: Option<PathBuf>,
    mbc_state: MbcState,
}

impl Cartridge {
    /// Construct a cartridge from an in-memory ROM image.
    ///
    /// Refuses images whose mapper type byte (0x0147) names a variant this
    /// core does not implement.
    pub fn load(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < 0x0150 {
            return Err(CartridgeError::Truncated(data.len()));
        }
        let header = Header::parse(&data);
        let cart_type = header.cart_type();
        let mbc = header
            .mbc_type()
            .ok_or(CartridgeError::UnsupportedMbc(cart_type))?;
        let title = header.title();
        let rom_bank_count = header.rom_bank_count();
        let ram_size = header.ram_size();
        let has_rtc = header.has_rtc();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                primary_bank: 1,
                secondary_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcType::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc.then(Rtc::default),
                latch_pending: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        core_info!(
            target: "cartridge",
            "loaded \"{}\": {:?}, {} ROM banks, {} bytes RAM",
            title,
            mbc,
            rom_bank_count,
            ram_size
        );

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            title,
            cart_type,
            rom_bank_count,
            save_path: None,
            mbc_state,
        })
    }

    /// Load a cartridge image from disk, picking up a `.sav` file next to it
    /// when the cartridge type declares battery-backed RAM.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let data = fs::read(&path)?;
        let mut cart = Self::load(data)?;

        if cart.has_battery() {
            let mut save = PathBuf::from(path.as_ref());
            save.set_extension("sav");
            cart.save_path = Some(save.clone());
            if let Ok(bytes) = fs::read(&save) {
                for (d, s) in cart.ram.iter_mut().zip(bytes.iter()) {
                    *d = *s;
                }
            }
        }

        Ok(cart)
    }

    /// Advance the RTC, when present, by the given master-clock cycle count.
    pub fn step_rtc(&mut self, cycles: u32) {
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &mut self.mbc_state {
            rtc.step(cycles);
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match (&self.mbc_state, addr) {
            (MbcState::NoMbc, 0x0000..=0x7FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::NoMbc, 0xA000..=0xBFFF) => self
                .ram
                .get(addr as usize - 0xA000)
                .copied()
                .unwrap_or(0xFF),

            (
                MbcState::Mbc1 {
                    secondary_bank,
                    mode,
                    ..
                },
                0x0000..=0x3FFF,
            ) => {
                // In advanced mode the low window shows bank secondary<<5.
                let bank = if *mode == 0 {
                    0
                } else {
                    ((*secondary_bank as usize) << 5) % self.rom_bank_count
                };
                self.rom_byte(bank, addr as usize)
            }
            (
                MbcState::Mbc1 {
                    primary_bank,
                    secondary_bank,
                    ..
                },
                0x4000..=0x7FFF,
            ) => {
                let bank = (((*secondary_bank as usize) << 5) | *primary_bank as usize)
                    % self.rom_bank_count;
                self.rom_byte(bank, addr as usize - 0x4000)
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }

            (MbcState::Mbc2 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc2 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = (*rom_bank as usize) % self.rom_bank_count;
                self.rom_byte(bank, addr as usize - 0x4000)
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    // 512x4-bit internal RAM, mirrored across the window; the
                    // upper nibble reads back set.
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    0xF0 | (self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F)
                }
            }

            (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = (*rom_bank as usize) % self.rom_bank_count;
                self.rom_byte(bank, addr as usize - 0x4000)
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    0xFF
                } else {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx =
                                (*ram_bank as usize) * RAM_BANK_SIZE + addr as usize - 0xA000;
                            self.ram.get(idx).copied().unwrap_or(0xFF)
                        }
                        0x08..=0x0C => rtc
                            .as_ref()
                            .map(|r| r.read_latched(*ram_bank))
                            .unwrap_or(0xFF),
                        _ => 0xFF,
                    }
                }
            }

            (MbcState::Mbc5 { .. }, 0x0000..=0x3FFF) => {
                self.rom.get(addr as usize).copied().unwrap_or(0xFF)
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                let bank = (*rom_bank as usize) % self.rom_bank_count;
                self.rom_byte(bank, addr as usize - 0x4000)
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    0xFF
                } else {
                    let idx = self.ram_index(addr);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }

            _ => 0xFF,
        }
    }

    /// Decode a control-window or RAM-window write. Writes into ROM-mapped
    /// addresses are never data stores; they drive the mapper latches.
    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                }
            }

            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { primary_bank, .. }, 0x2000..=0x3FFF) => {
                *primary_bank = val & 0x1F;
                // Bank 0 cannot be selected through the 5-bit register, so
                // writes of 0x00/0x20/0x40/0x60 all land on the next bank up.
                if *primary_bank == 0 {
                    *primary_bank = 1;
                }
            }
            (MbcState::Mbc1 { secondary_bank, .. }, 0x4000..=0x5FFF) => {
                *secondary_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }

            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // Address bit 8 selects between RAMG and ROMB over the whole
                // control range.
                if addr & 0x0100 == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = val & 0x0F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val & 0x0F;
                    }
                }
            }

            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                // Writing 0 then 1 copies the live clock into the latched
                // registers.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    if let Some(rtc) = rtc {
                        rtc.latch();
                    }
                    *latch_pending = false;
                } else {
                    *latch_pending = false;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx =
                                (*ram_bank as usize) * RAM_BANK_SIZE + addr as usize - 0xA000;
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = rtc.as_mut() {
                                rtc.write_register(*ram_bank, val);
                            }
                        }
                        _ => {}
                    }
                }
            }

            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0x00FF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable {
                    let idx = self.ram_index(addr);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }

            _ => {}
        }
    }

    fn rom_byte(&self, bank: usize, offset: usize) -> u8 {
        self.rom
            .get(bank * ROM_BANK_SIZE + offset)
            .copied()
            .unwrap_or(0xFF)
    }

    fn ram_index(&self, addr: u16) -> usize {
        let ram_bank_count = self.ram.len().div_ceil(RAM_BANK_SIZE).max(1);
        match &self.mbc_state {
            MbcState::Mbc1 {
                secondary_bank,
                mode,
                ..
            } => {
                // Simple mode always maps RAM bank 0; advanced mode banks with
                // the secondary register.
                if *mode == 0 {
                    addr as usize - 0xA000
                } else {
                    let bank = (*secondary_bank as usize) % ram_bank_count;
                    bank * RAM_BANK_SIZE + addr as usize - 0xA000
                }
            }
            MbcState::Mbc5 { ram_bank, .. } => {
                let bank = (*ram_bank as usize) % ram_bank_count;
                bank * RAM_BANK_SIZE + addr as usize - 0xA000
            }
            _ => addr as usize - 0xA000,
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    /// Write battery-backed RAM next to the ROM image. When and how often to
    /// flush is the host's call; the core just writes through.
    pub fn save_ram(&self) -> io::Result<()> {
        if let (true, Some(path)) = (self.has_battery(), &self.save_path) {
            if !self.ram.is_empty() {
                fs::write(path, &self.ram)?;
            }
        }
        Ok(())
    }
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let mut slice = &self.data[0x0134..0x0143];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn mbc_type(&self) -> Option<MbcType> {
        match self.cart_type() {
            0x00 | 0x08 | 0x09 => Some(MbcType::NoMbc),
            0x01..=0x03 => Some(MbcType::Mbc1),
            0x05 | 0x06 => Some(MbcType::Mbc2),
            0x0F..=0x13 => Some(MbcType::Mbc3),
            0x19..=0x1E => Some(MbcType::Mbc5),
            _ => None,
        }
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10)
    }

    /// ROM size code at 0x0148: 0 => 2 banks (32 KiB) doubling up to
    /// 6 => 128 banks (2 MiB).
    fn rom_bank_count(&self) -> usize {
        match self.data[0x0148] {
            code @ 0x00..=0x06 => 2 << code,
            // Unknown code: trust the image length instead.
            _ => (self.data.len() / ROM_BANK_SIZE).max(1),
        }
    }

    /// RAM size code at 0x0149.
    fn ram_size(&self) -> usize {
        // MBC2 carries its own 512x4-bit RAM regardless of the header code.
        if matches!(self.cart_type(), 0x05 | 0x06) {
            return 0x200;
        }
        match self.data[0x0149] {
            0x01 => 0x0800,  // 2 KiB
            0x02 => 0x2000,  // 8 KiB
            0x03 => 0x8000,  // 32 KiB (4 banks)
            0x04 => 0x20000, // 128 KiB (16 banks)
            _ => 0,
        }
    }
}
