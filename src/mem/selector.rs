/*!
Mapping of line addresses to bank/set indices.

The choice of mapping trades hardware cost against balance of accesses
across banks; the simulator offers the classic family, selected by name at
startup. Every selector is a pure function from a line address to a
`(tag, index)` pair with an exact inverse.
*/

use crate::config::ConfigError;
use crate::mem::MemAddr;

#[derive(Debug, Clone)]
pub enum BankSelector {
    /// Always bank 0 (single-bank memories, and worst-case conflict tests).
    Zero { banks: usize },
    /// Low-order bits via div/mod (any bank count).
    Direct { banks: usize },
    /// Low-order bits via shift/mask (power-of-two bank count).
    DirectBinary { banks: usize, shift: u32, mask: u64 },
    /// Four full-width rotate-xor mixes, then modulo.
    RotationMix4 { banks: usize },
    /// `(addr XOR (addr / banks)) % banks`.
    RightXor { banks: usize },
    /// `(addr + (addr / banks)) % banks`.
    RightAdd { banks: usize },
    /// XOR-fold of all banks-sized sub-words of the address.
    XorFold { banks: usize },
    /// Add-fold of all banks-sized sub-words of the address.
    AddFold { banks: usize },
}

impl BankSelector {
    /// Construct by configured name. A single bank always degrades to the
    /// zero selector.
    pub fn from_name(name: &str, banks: usize) -> Result<Self, ConfigError> {
        if banks == 1 || name == "ZERO" {
            return Ok(BankSelector::Zero { banks });
        }
        match name {
            "DIRECT" => {
                if banks.is_power_of_two() {
                    Ok(BankSelector::DirectBinary {
                        banks,
                        shift: banks.trailing_zeros(),
                        mask: banks as u64 - 1,
                    })
                } else {
                    Ok(BankSelector::Direct { banks })
                }
            }
            "RMIX" => Ok(BankSelector::RotationMix4 { banks }),
            "XORLSB" => Ok(BankSelector::RightXor { banks }),
            "ADDLSB" => Ok(BankSelector::RightAdd { banks }),
            "XORFOLD" => Ok(BankSelector::XorFold { banks }),
            "ADDFOLD" => Ok(BankSelector::AddFold { banks }),
            _ => Err(ConfigError::UnknownName {
                what: "banking strategy",
                name: name.to_string(),
            }),
        }
    }

    pub fn num_banks(&self) -> usize {
        match *self {
            BankSelector::Zero { banks }
            | BankSelector::Direct { banks }
            | BankSelector::DirectBinary { banks, .. }
            | BankSelector::RotationMix4 { banks }
            | BankSelector::RightXor { banks }
            | BankSelector::RightAdd { banks }
            | BankSelector::XorFold { banks }
            | BankSelector::AddFold { banks } => banks,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BankSelector::Zero { .. } => "bank 0 only",
            BankSelector::Direct { .. } => "direct (div+mod)",
            BankSelector::DirectBinary { .. } => "direct (shift+and)",
            BankSelector::RotationMix4 { .. } => "4-bit full rotation mix",
            BankSelector::RightXor { .. } => "(addr XOR (addr / numbanks)) % numbanks",
            BankSelector::RightAdd { .. } => "(addr + (addr / numbanks)) % numbanks",
            BankSelector::XorFold { .. } => "XOR fold of numbanks-sized sub-words",
            BankSelector::AddFold { .. } => "add fold of numbanks-sized sub-words",
        }
    }

    /// Map a line address to `(tag, bank index)`.
    pub fn map(&self, address: MemAddr) -> (MemAddr, usize) {
        match *self {
            BankSelector::Zero { .. } => (address, 0),
            BankSelector::Direct { banks } => {
                (address / banks as u64, (address % banks as u64) as usize)
            }
            BankSelector::DirectBinary { shift, mask, .. } => {
                (address >> shift, (address & mask) as usize)
            }
            BankSelector::RotationMix4 { banks } => {
                let mut a = address;
                a ^= a.rotate_right(32);
                a ^= a.rotate_right(16);
                a ^= a.rotate_right(8);
                a ^= a.rotate_right(4);
                (address, (a % banks as u64) as usize)
            }
            BankSelector::RightXor { banks } => {
                let b = banks as u64;
                (address, ((address ^ (address / b)) % b) as usize)
            }
            BankSelector::RightAdd { banks } => {
                let b = banks as u64;
                (
                    address,
                    ((address.wrapping_add(address / b)) % b) as usize,
                )
            }
            BankSelector::XorFold { banks } => {
                let b = banks as u64;
                let mut a = address;
                let mut result = 0u64;
                loop {
                    result ^= a;
                    a /= b;
                    if a <= b {
                        break;
                    }
                }
                (address, (result % b) as usize)
            }
            BankSelector::AddFold { banks } => {
                let b = banks as u64;
                let mut a = address;
                let mut result = 0u64;
                loop {
                    result = result.wrapping_add(a);
                    a /= b;
                    if a <= b {
                        break;
                    }
                }
                (address, (result % b) as usize)
            }
        }
    }

    /// Reconstruct the line address from a `(tag, index)` pair.
    pub fn unmap(&self, tag: MemAddr, index: usize) -> MemAddr {
        match *self {
            BankSelector::Direct { banks } => tag * banks as u64 + index as u64,
            BankSelector::DirectBinary { shift, .. } => (tag << shift) | index as u64,
            // The remaining selectors keep the whole address as the tag.
            _ => tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 7] = [
        "ZERO", "DIRECT", "RMIX", "XORLSB", "ADDLSB", "XORFOLD", "ADDFOLD",
    ];

    #[test]
    fn map_unmap_round_trip() {
        for name in NAMES {
            for banks in [1usize, 3, 4, 8] {
                let sel = BankSelector::from_name(name, banks).unwrap();
                for addr in [0u64, 1, 63, 64, 0x1234, 0xdead_beef, u32::MAX as u64 + 17] {
                    let (tag, index) = sel.map(addr);
                    assert!(index < banks.max(1), "{name}: index out of range");
                    assert_eq!(
                        sel.unmap(tag, index),
                        addr,
                        "{name} with {banks} banks fails round-trip at {addr:#x}"
                    );
                }
            }
        }
    }

    #[test]
    fn direct_binary_used_for_power_of_two() {
        let sel = BankSelector::from_name("DIRECT", 8).unwrap();
        assert!(matches!(sel, BankSelector::DirectBinary { .. }));
        let sel = BankSelector::from_name("DIRECT", 6).unwrap();
        assert!(matches!(sel, BankSelector::Direct { .. }));
    }

    #[test]
    fn single_bank_degrades_to_zero() {
        let sel = BankSelector::from_name("XORFOLD", 1).unwrap();
        assert!(matches!(sel, BankSelector::Zero { .. }));
        assert_eq!(sel.map(0x123).1, 0);
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        assert!(BankSelector::from_name("FANCY", 4).is_err());
    }

    #[test]
    fn direct_spreads_consecutive_lines() {
        let sel = BankSelector::from_name("DIRECT", 4).unwrap();
        let idx: Vec<usize> = (0..8u64).map(|a| sel.map(a).1).collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
