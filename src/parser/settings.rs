use std::fmt;
use std::sync::LazyLock;

use sha2::{Digest, Sha256};

use super::elements::ElementTable;
use super::sections::{FieldDef, RawField};
use crate::error::IngestError;

/// Nucleon rest-mass energy, MeV.
pub const NUCLEON_MASS_MEV: f64 = 931.494;
/// Speed of light in units that pair with Brho in Tm.
pub const LIGHT_SPEED: f64 = 299.8;

pub const STAGES: usize = 8;

const NUM: &str = r"([+-]?[\d.]+)";

const BRHO_KEYS: [&str; STAGES] = [
    "brho_1", "brho_2", "brho_3", "brho_4", "brho_5", "brho_6", "brho_7", "brho_8",
];
const ENERGY_KEYS: [&str; STAGES] = [
    "energy_1", "energy_2", "energy_3", "energy_4", "energy_5", "energy_6", "energy_7", "energy_8",
];

fn num_list(n: usize) -> String {
    vec![NUM; n].join(",")
}

struct SlitDefs {
    x: FieldDef,
    y: Option<FieldDef>,
}

struct Catalogue {
    model: FieldDef,
    coeff: FieldDef,
    beam: FieldDef,
    intensity: FieldDef,
    centred: FieldDef,
    target_thickness: FieldDef,
    wedge_thickness: [FieldDef; 2],
    wedge_angle: [FieldDef; 2],
    wedge2_contents: FieldDef,
    brho: Vec<FieldDef>,
    dump: FieldDef,
    slits: Vec<SlitDefs>,
}

fn slit_x(marker: &str) -> FieldDef {
    FieldDef::new(
        marker,
        &format!("X_size = {}", num_list(5)),
        &[(2, "left"), (4, "right")],
    )
}

fn slit_y(marker: &str) -> FieldDef {
    FieldDef::new(
        marker,
        &format!("Y_size = {}", num_list(5)),
        &[(2, "left"), (4, "right")],
    )
}

static CATALOGUE: LazyLock<Catalogue> = LazyLock::new(|| {
    let wedge = |name: &str| format!("Name = {} Wedge", regex::escape(name));
    let slit = |name: &str| format!("Name = {} slit", regex::escape(name));
    Catalogue {
        model: FieldDef::new(
            r"\[convolution\]",
            &format!("Convolution mode = {NUM}"),
            &[(1, "model")],
        ),
        coeff: FieldDef::new(
            r"\[convolution\]",
            &format!("CoefConv_1 = {NUM}"),
            &[(1, "coeff")],
        ),
        beam: FieldDef::new(
            r"\[settings\]",
            r"A,Z,Q = (\d+)([A-Za-z]+)",
            &[(1, "mass"), (2, "symbol")],
        ),
        intensity: FieldDef::new(
            r"\[settings\]",
            r"Intensity = ([\d.]+)",
            &[(1, "intensity")],
        ),
        centred: FieldDef::new(
            r"\[settings\]",
            r"Settings on A,Z = (\d+)([A-Za-z]+)",
            &[(1, "mass"), (2, "symbol")],
        ),
        target_thickness: FieldDef::new(
            r"\[target\]",
            &format!("Target thickness = {}", num_list(3)),
            &[(2, "thickness")],
        ),
        wedge_thickness: ["F1", "F5"].map(|w| {
            FieldDef::new(
                &wedge(w),
                &format!("thickness = {}", num_list(6)),
                &[(2, "thickness")],
            )
        }),
        wedge_angle: ["F1", "F5"]
            .map(|w| FieldDef::new(&wedge(w), &format!("Angle = {NUM}"), &[(1, "angle")])),
        wedge2_contents: FieldDef::new(
            &wedge("F5"),
            &format!("contents1 = {}", num_list(4)),
            &[(2, "z")],
        ),
        brho: (1..=STAGES)
            .map(|i| {
                FieldDef::new(
                    &format!(r"\[D{i}_DipoleSettings\]"),
                    &format!(r"Brho = {NUM}\s+Tm"),
                    &[(1, "brho")],
                )
            })
            .collect(),
        dump: slit_x("Name = ExitBeamDump"),
        slits: ["F1", "F2", "F2.5", "F5", "F7"]
            .iter()
            .map(|s| SlitDefs {
                x: slit_x(&slit(s)),
                y: (*s == "F2.5").then(|| slit_y(&slit(s))),
            })
            .collect(),
    }
});

// ── Raw (unvalidated) record ──

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawGap {
    pub left: Option<String>,
    pub right: Option<String>,
}

impl RawGap {
    fn from_field(mut f: RawField) -> Self {
        RawGap {
            left: f.remove("left"),
            right: f.remove("right"),
        }
    }
}

/// Every value the assembler needs, as captured. `None` means the section
/// marker or the value line was never found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSettings {
    pub model: Option<String>,
    pub coeff: Option<String>,
    pub beam_mass: Option<String>,
    pub beam_symbol: Option<String>,
    pub intensity: Option<String>,
    pub centred_mass: Option<String>,
    pub centred_symbol: Option<String>,
    pub target_thickness: Option<String>,
    pub wedge1_thickness: Option<String>,
    pub wedge1_angle: Option<String>,
    pub wedge2_z: Option<String>,
    pub wedge2_thickness: Option<String>,
    pub wedge2_angle: Option<String>,
    pub brho: [Option<String>; STAGES],
    pub dump: RawGap,
    pub f1: RawGap,
    pub f2: RawGap,
    pub f25_x: RawGap,
    pub f25_y: RawGap,
    pub f5: RawGap,
    pub f7: RawGap,
}

impl RawSettings {
    pub fn extract(lines: &[&str]) -> Self {
        let c = &*CATALOGUE;
        let one = |def: &FieldDef, key: &str| def.extract(lines).remove(key);

        let mut beam = c.beam.extract(lines);
        let mut centred = c.centred.extract(lines);
        let mut slits = c.slits.iter().map(|s| {
            let x = RawGap::from_field(s.x.extract(lines));
            let y = s
                .y
                .as_ref()
                .map(|d| RawGap::from_field(d.extract(lines)))
                .unwrap_or_default();
            (x, y)
        });
        let mut next_slit = || slits.next().unwrap_or_default();
        let (f1, _) = next_slit();
        let (f2, _) = next_slit();
        let (f25_x, f25_y) = next_slit();
        let (f5, _) = next_slit();
        let (f7, _) = next_slit();

        RawSettings {
            model: one(&c.model, "model"),
            coeff: one(&c.coeff, "coeff"),
            beam_mass: beam.remove("mass"),
            beam_symbol: beam.remove("symbol"),
            intensity: one(&c.intensity, "intensity"),
            centred_mass: centred.remove("mass"),
            centred_symbol: centred.remove("symbol"),
            target_thickness: one(&c.target_thickness, "thickness"),
            wedge1_thickness: one(&c.wedge_thickness[0], "thickness"),
            wedge1_angle: one(&c.wedge_angle[0], "angle"),
            wedge2_z: one(&c.wedge2_contents, "z"),
            wedge2_thickness: one(&c.wedge_thickness[1], "thickness"),
            wedge2_angle: one(&c.wedge_angle[1], "angle"),
            brho: std::array::from_fn(|i| one(&c.brho[i], "brho")),
            dump: RawGap::from_field(c.dump.extract(lines)),
            f1,
            f2,
            f25_x,
            f25_y,
            f5,
            f7,
        }
    }
}

// ── Assembled configuration ──

/// A numeric value kept together with the exact text it was captured from.
/// The text feeds the content hash; the number feeds the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Measured {
    pub text: String,
    pub value: f64,
}

impl Measured {
    pub fn parse(field: &'static str, text: &str) -> Result<Self, IngestError> {
        let value = text.parse::<f64>().map_err(|_| IngestError::InvalidNumber {
            field,
            value: text.to_string(),
        })?;
        Ok(Measured {
            text: text.to_string(),
            value,
        })
    }
}

impl fmt::Display for Measured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub left: Measured,
    pub right: Measured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slits {
    pub dump: Gap,
    pub f1: Gap,
    pub f2: Gap,
    pub f25_x: Gap,
    pub f25_y: Gap,
    pub f5: Gap,
    pub f7: Gap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub model: String,
    pub coeff: Measured,
    /// Primary beam, e.g. "136Xe".
    pub nuclide: String,
    pub intensity: Measured,
    /// Centred nuclide, e.g. "84Se".
    pub symbol: String,
    /// Element part of `symbol`, e.g. "Se". Not hashed: it is derived from `symbol`.
    pub element: String,
    pub a: u32,
    pub z: u32,
    pub n: u32,
    pub target_thickness: Measured,
    pub wedge1_thickness: Measured,
    pub wedge1_angle: Measured,
    pub wedge2_material: String,
    pub wedge2_thickness: Measured,
    pub wedge2_angle: Measured,
    pub brho: [Measured; STAGES],
    pub energy: [f64; STAGES],
    pub slits: Slits,
}

/// One stored column of a configuration, in the shape needed for both
/// hashing and binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Int(u32),
    Captured(&'a Measured),
    Derived(f64),
}

impl FieldValue<'_> {
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(s) => (*s).to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Captured(m) => m.text.clone(),
            FieldValue::Derived(v) => v.to_string(),
        }
    }
}

/// Relativistic kinetic energy per nucleon (MeV/u) of a nucleus of mass
/// number `a` and charge `z` at magnetic rigidity `brho` (Tm).
pub fn kinetic_energy(a: f64, z: f64, brho: f64) -> f64 {
    let p = LIGHT_SPEED * z * brho / (a * NUCLEON_MASS_MEV);
    NUCLEON_MASS_MEV * ((1.0 + p * p).sqrt() - 1.0)
}

fn required<'a>(v: &'a Option<String>, field: &'static str) -> Result<&'a str, IngestError> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(IngestError::MissingField { field })
}

fn measured(v: &Option<String>, field: &'static str) -> Result<Measured, IngestError> {
    Measured::parse(field, required(v, field)?)
}

fn gap(raw: &RawGap, left: &'static str, right: &'static str) -> Result<Gap, IngestError> {
    Ok(Gap {
        left: measured(&raw.left, left)?,
        right: measured(&raw.right, right)?,
    })
}

fn parse_mass(field: &'static str, text: &str) -> Result<u32, IngestError> {
    text.parse().map_err(|_| IngestError::InvalidNumber {
        field,
        value: text.to_string(),
    })
}

fn material_symbol(text: &str, elements: &ElementTable) -> Result<String, IngestError> {
    let invalid = || IngestError::InvalidNumber {
        field: "wedge2_material",
        value: text.to_string(),
    };
    let z: f64 = text.parse().map_err(|_| invalid())?;
    if z.fract() != 0.0 || z < 1.0 {
        return Err(invalid());
    }
    let z = z as u32;
    elements
        .symbol(z)
        .map(str::to_string)
        .ok_or(IngestError::UnknownElement { z })
}

/// Combine raw captures into a validated configuration. Any missing field,
/// unparseable number, or unknown symbol fails the whole record.
pub fn assemble(raw: &RawSettings, elements: &ElementTable) -> Result<Configuration, IngestError> {
    let element = required(&raw.centred_symbol, "symbol")?.to_string();
    let a = parse_mass("a", required(&raw.centred_mass, "a")?)?;
    let z = elements
        .atomic_number(&element)
        .ok_or_else(|| IngestError::UnknownSymbol {
            symbol: element.clone(),
        })?;
    let symbol = format!("{a}{element}");
    let n = a.checked_sub(z).ok_or_else(|| IngestError::InvalidNuclide {
        symbol: symbol.clone(),
        a,
        z,
    })?;

    let nuclide = format!(
        "{}{}",
        required(&raw.beam_mass, "nuclide")?,
        required(&raw.beam_symbol, "nuclide")?
    );

    let mut brho = Vec::with_capacity(STAGES);
    for (i, value) in raw.brho.iter().enumerate() {
        brho.push(measured(value, BRHO_KEYS[i])?);
    }
    let brho: [Measured; STAGES] = brho
        .try_into()
        .map_err(|_| IngestError::MissingField { field: "brho" })?;
    let energy = std::array::from_fn(|i| kinetic_energy(a as f64, z as f64, brho[i].value));

    Ok(Configuration {
        model: required(&raw.model, "model")?.to_string(),
        coeff: measured(&raw.coeff, "coeff")?,
        nuclide,
        intensity: measured(&raw.intensity, "intensity")?,
        symbol,
        element,
        a,
        z,
        n,
        target_thickness: measured(&raw.target_thickness, "target_thickness")?,
        wedge1_thickness: measured(&raw.wedge1_thickness, "wedge1_thickness")?,
        wedge1_angle: measured(&raw.wedge1_angle, "wedge1_angle")?,
        wedge2_material: material_symbol(required(&raw.wedge2_z, "wedge2_material")?, elements)?,
        wedge2_thickness: measured(&raw.wedge2_thickness, "wedge2_thickness")?,
        wedge2_angle: measured(&raw.wedge2_angle, "wedge2_angle")?,
        brho,
        energy,
        slits: Slits {
            dump: gap(&raw.dump, "dump_left", "dump_right")?,
            f1: gap(&raw.f1, "f1_left", "f1_right")?,
            f2: gap(&raw.f2, "f2_left", "f2_right")?,
            f25_x: gap(&raw.f25_x, "f25x_left", "f25x_right")?,
            f25_y: gap(&raw.f25_y, "f25y_left", "f25y_right")?,
            f5: gap(&raw.f5, "f5_left", "f5_right")?,
            f7: gap(&raw.f7, "f7_left", "f7_right")?,
        },
    })
}

impl Configuration {
    /// Stored columns in their fixed order. This order is also the hash order,
    /// so appending is the only safe change.
    pub fn columns(&self) -> Vec<(&'static str, FieldValue<'_>)> {
        use FieldValue::*;
        let mut cols = vec![
            ("model", Text(&self.model)),
            ("coeff", Captured(&self.coeff)),
            ("nuclide", Text(&self.nuclide)),
            ("intensity", Captured(&self.intensity)),
            ("symbol", Text(&self.symbol)),
            ("a", Int(self.a)),
            ("z", Int(self.z)),
            ("n", Int(self.n)),
            ("target_thickness", Captured(&self.target_thickness)),
            ("wedge1_thickness", Captured(&self.wedge1_thickness)),
            ("wedge1_angle", Captured(&self.wedge1_angle)),
            ("wedge2_material", Text(&self.wedge2_material)),
            ("wedge2_thickness", Captured(&self.wedge2_thickness)),
            ("wedge2_angle", Captured(&self.wedge2_angle)),
        ];
        for (key, b) in BRHO_KEYS.iter().zip(&self.brho) {
            cols.push((*key, Captured(b)));
        }
        for (key, e) in ENERGY_KEYS.iter().zip(self.energy) {
            cols.push((*key, Derived(e)));
        }
        let s = &self.slits;
        for (left, right, g) in [
            ("dump_left", "dump_right", &s.dump),
            ("f1_left", "f1_right", &s.f1),
            ("f2_left", "f2_right", &s.f2),
            ("f25x_left", "f25x_right", &s.f25_x),
            ("f25y_left", "f25y_right", &s.f25_y),
            ("f5_left", "f5_right", &s.f5),
            ("f7_left", "f7_right", &s.f7),
        ] {
            cols.push((left, Captured(&g.left)));
            cols.push((right, Captured(&g.right)));
        }
        cols
    }

    /// `key=value` lines in column order.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.columns() {
            out.push_str(key);
            out.push('=');
            out.push_str(&value.canonical());
            out.push('\n');
        }
        out
    }

    /// Lowercase hex SHA-256 of the canonical string.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_string().as_bytes());
        let mut hex = String::with_capacity(64);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{:02x}", b);
        }
        hex
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/84Se.lpp").unwrap()
    }

    fn raw_from(text: &str) -> RawSettings {
        let lines: Vec<&str> = text.lines().collect();
        RawSettings::extract(&lines)
    }

    fn assembled() -> Configuration {
        assemble(&raw_from(&fixture()), &ElementTable::standard()).unwrap()
    }

    #[test]
    fn fixture_raw_fields() {
        let raw = raw_from(&fixture());
        assert_eq!(raw.model.as_deref(), Some("2"));
        assert_eq!(raw.coeff.as_deref(), Some("0.75"));
        assert_eq!(raw.beam_mass.as_deref(), Some("136"));
        assert_eq!(raw.beam_symbol.as_deref(), Some("Xe"));
        assert_eq!(raw.intensity.as_deref(), Some("50"));
        assert_eq!(raw.target_thickness.as_deref(), Some("3.5"));
        assert_eq!(raw.wedge1_thickness.as_deref(), Some("2.21"));
        assert_eq!(raw.wedge1_angle.as_deref(), Some("0.612"));
        assert_eq!(raw.wedge2_z.as_deref(), Some("6"));
        assert_eq!(raw.wedge2_angle.as_deref(), Some("-0.44"));
        assert_eq!(raw.brho[0].as_deref(), Some("3.1234"));
        assert_eq!(raw.brho[7].as_deref(), Some("3.0056"));
        assert_eq!(raw.dump.left.as_deref(), Some("-60"));
        assert_eq!(raw.f25_x.right.as_deref(), Some("10"));
        assert_eq!(raw.f25_y.left.as_deref(), Some("-5"));
        assert_eq!(raw.f7.right.as_deref(), Some("15"));
    }

    #[test]
    fn centred_nuclide_resolved() {
        let cfg = assembled();
        assert_eq!(cfg.symbol, "84Se");
        assert_eq!(cfg.element, "Se");
        assert_eq!((cfg.a, cfg.z, cfg.n), (84, 34, 50));
        assert_eq!(cfg.a, cfg.z + cfg.n);
        assert_eq!(cfg.nuclide, "136Xe");
        assert_eq!(cfg.wedge2_material, "C");
    }

    #[test]
    fn stage_energies() {
        let cfg = assembled();
        assert!((cfg.energy[0] - 74.15756717269805).abs() < 1e-9);
        assert_eq!(cfg.energy[0], kinetic_energy(84.0, 34.0, 3.1234));
        assert_eq!(cfg.energy[1], kinetic_energy(84.0, 34.0, 3.1101));
        assert!(cfg.energy[0] > cfg.energy[1]);
        assert_eq!(cfg.energy[3], cfg.energy[7]);
    }

    #[test]
    fn energy_is_per_nucleon() {
        // Same A/Z ratio, same rigidity: same energy per nucleon.
        let light = kinetic_energy(42.0, 17.0, 3.1234);
        let heavy = kinetic_energy(84.0, 34.0, 3.1234);
        assert!((light - heavy).abs() < 1e-9);
    }

    #[test]
    fn zero_rigidity_has_zero_energy() {
        assert_eq!(kinetic_energy(84.0, 34.0, 0.0), 0.0);
    }

    #[test]
    fn missing_field_is_fatal() {
        let text = fixture().replace("[D5_DipoleSettings]", "[D5_Unused]");
        let err = assemble(&raw_from(&text), &ElementTable::standard()).unwrap_err();
        assert_eq!(err, IngestError::MissingField { field: "brho_5" });
    }

    #[test]
    fn unknown_symbol_is_fatal() {
        let text = fixture().replace("Settings on A,Z = 84Se34+", "Settings on A,Z = 84Qq34+");
        let err = assemble(&raw_from(&text), &ElementTable::standard()).unwrap_err();
        assert_eq!(
            err,
            IngestError::UnknownSymbol {
                symbol: "Qq".to_string()
            }
        );
    }

    #[test]
    fn malformed_number_is_fatal() {
        let text = fixture().replace("CoefConv_1 = 0.75", "CoefConv_1 = 0.7.5");
        let err = assemble(&raw_from(&text), &ElementTable::standard()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidNumber { field: "coeff", .. }));
    }

    #[test]
    fn hash_is_deterministic() {
        let a = assembled();
        let b = assembled();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn hash_uses_captured_text() {
        let a = assembled();
        let text = fixture().replace("Brho = 3.1234 Tm", "Brho = 3.12340 Tm");
        let b = assemble(&raw_from(&text), &ElementTable::standard()).unwrap();
        assert_eq!(a.brho[0].value, b.brho[0].value);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn any_field_change_changes_hash() {
        let base = assembled();
        let mut other = base.clone();
        other.slits.f7.right = Measured::parse("f7_right", "16").unwrap();
        assert_ne!(base.content_hash(), other.content_hash());

        let mut other = base.clone();
        other.model = "3".to_string();
        assert_ne!(base.content_hash(), other.content_hash());
    }

    #[test]
    fn columns_are_complete() {
        let cfg = assembled();
        let cols = cfg.columns();
        assert_eq!(cols.len(), 14 + 2 * STAGES + 14);
        assert_eq!(cols[0].0, "model");
        assert_eq!(cols.last().map(|c| c.0), Some("f7_right"));
    }
}
