use std::collections::HashMap;

const SYMBOLS: [&str; 118] = [
    // 1-18
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar",
    // 19-36
    "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se",
    "Br", "Kr",
    // 37-54
    "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn", "Sb", "Te",
    "I", "Xe",
    // 55-86
    "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb",
    "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn",
    // 87-118
    "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm", "Md", "No",
    "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Symbol ⇄ atomic number mapping. Built once and passed by reference to
/// everything that resolves nuclides.
#[derive(Debug, Clone)]
pub struct ElementTable {
    by_symbol: HashMap<&'static str, u32>,
}

impl ElementTable {
    pub fn standard() -> Self {
        let by_symbol = SYMBOLS
            .iter()
            .enumerate()
            .map(|(i, s)| (*s, i as u32 + 1))
            .collect();
        ElementTable { by_symbol }
    }

    /// Case-sensitive: "Nb" resolves, "NB" and "nb" do not.
    pub fn atomic_number(&self, symbol: &str) -> Option<u32> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn symbol(&self, z: u32) -> Option<&'static str> {
        let idx = usize::try_from(z).ok()?.checked_sub(1)?;
        SYMBOLS.get(idx).copied()
    }
}

impl Default for ElementTable {
    fn default() -> Self {
        Self::standard()
    }
}
