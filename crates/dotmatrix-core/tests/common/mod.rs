use dotmatrix_core::{cartridge::Cartridge, gameboy::GameBoy};

/// Flat 32 KiB no-MBC image with `program` placed at the post-boot entry
/// point (0x0100). The rest of the image is zero, i.e. NOPs.
#[allow(dead_code)]
pub fn rom_with_program(program: &[u8]) -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    rom[0x0100..0x0100 + program.len()].copy_from_slice(program);
    rom
}

/// A machine in the reset state with `program` mapped at the entry point.
#[allow(dead_code)]
pub fn boot_with_program(program: &[u8]) -> GameBoy {
    let mut gb = GameBoy::new();
    gb.load_cart(Cartridge::load(rom_with_program(program)).expect("synthetic ROM should load"));
    gb
}
