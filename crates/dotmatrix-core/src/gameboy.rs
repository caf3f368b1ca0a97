use crate::{cartridge::Cartridge, cpu::Cpu, mmu::Mmu};

/// The owning aggregate: one CPU wired to one bus.
///
/// Hosts drive the machine by calling [`GameBoy::step`] in a loop and pacing
/// external devices with the returned machine-cycle count.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            mmu: Mmu::new(),
        }
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.mmu.load_cart(cart);
    }

    /// Execute one CPU step and return the machine cycles it consumed.
    pub fn step(&mut self) -> u8 {
        self.cpu.step(&mut self.mmu);
        self.cpu.cycles_delta
    }

    /// Reset to the power-on state while preserving the loaded cartridge.
    pub fn reset(&mut self) {
        let cart = self.mmu.cart.take();
        self.cpu = Cpu::new();
        self.mmu = Mmu::new();
        if let Some(c) = cart {
            self.mmu.load_cart(c);
        }
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}
