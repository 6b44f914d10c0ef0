//! Space groups: generator table, group closure, equivalence, extinction.

use crate::error::{Error, Result};
use crate::miller::MillerIndex;
use crate::symop::SymOp;
use nalgebra::RowVector3;
use std::fmt;

/// Cancellation threshold for the extinction phase sum.
const EXTINCTION_EPS: f64 = 1e-3;

/// Hermann-Mauguin symbols with their generators in Jones faithful
/// notation (identity omitted, centring translations and the inversion
/// listed explicitly). Standard settings; monoclinic cells are b-unique,
/// rhombohedral groups use hexagonal axes, origin choice 2 where the
/// tables offer two.
const SYMBOL_TABLE: &[(&str, &str)] = &[
    // triclinic
    ("P 1", ""),
    ("P -1", "-x,-y,-z"),
    // monoclinic
    ("P 2", "-x,y,-z"),
    ("P 21", "-x,y+1/2,-z"),
    ("C 2", "-x,y,-z;x+1/2,y+1/2,z"),
    ("P m", "x,-y,z"),
    ("P c", "x,-y,z+1/2"),
    ("C m", "x,-y,z;x+1/2,y+1/2,z"),
    ("C c", "x,-y,z+1/2;x+1/2,y+1/2,z"),
    ("P 2/m", "-x,y,-z;-x,-y,-z"),
    ("P 21/m", "-x,y+1/2,-z;-x,-y,-z"),
    ("C 2/m", "-x,y,-z;-x,-y,-z;x+1/2,y+1/2,z"),
    ("P 2/c", "-x,y,-z+1/2;-x,-y,-z"),
    ("P 21/c", "-x,y+1/2,-z+1/2;-x,-y,-z"),
    ("C 2/c", "-x,y,-z+1/2;-x,-y,-z;x+1/2,y+1/2,z"),
    // orthorhombic
    ("P 2 2 2", "-x,-y,z;-x,y,-z"),
    ("P 2 2 21", "-x,-y,z+1/2;x,-y,-z"),
    ("P 21 21 2", "-x,-y,z;x+1/2,-y+1/2,-z"),
    ("P 21 21 21", "x+1/2,-y+1/2,-z;-x,y+1/2,-z+1/2"),
    ("C 2 2 21", "-x,-y,z+1/2;-x,y,-z+1/2;x+1/2,y+1/2,z"),
    ("C 2 2 2", "-x,-y,z;-x,y,-z;x+1/2,y+1/2,z"),
    ("F 2 2 2", "-x,-y,z;-x,y,-z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I 2 2 2", "-x,-y,z;-x,y,-z;x+1/2,y+1/2,z+1/2"),
    ("I 21 21 21", "x+1/2,-y+1/2,-z;-x,y+1/2,-z+1/2;x+1/2,y+1/2,z+1/2"),
    ("P m m 2", "-x,-y,z;x,-y,z"),
    ("P c a 21", "-x,-y,z+1/2;x+1/2,-y,z"),
    ("P n a 21", "-x,-y,z+1/2;x+1/2,-y+1/2,z"),
    ("C m c 21", "-x,-y,z+1/2;x,-y,z+1/2;x+1/2,y+1/2,z"),
    ("P m m m", "-x,-y,z;-x,y,-z;-x,-y,-z"),
    ("P b c a", "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;-x,-y,-z"),
    ("P n m a", "-x+1/2,-y,z+1/2;-x,y+1/2,-z;-x,-y,-z"),
    ("P b c n", "-x+1/2,-y+1/2,z+1/2;-x,y,-z+1/2;-x,-y,-z"),
    ("C m c m", "-x,-y,z+1/2;-x,y,-z+1/2;-x,-y,-z;x+1/2,y+1/2,z"),
    ("C m m m", "-x,-y,z;-x,y,-z;-x,-y,-z;x+1/2,y+1/2,z"),
    ("F m m m", "-x,-y,z;-x,y,-z;-x,-y,-z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I m m m", "-x,-y,z;-x,y,-z;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    // tetragonal
    ("P 4", "-y,x,z"),
    ("P 41", "-y,x,z+1/4"),
    ("P 42", "-y,x,z+1/2"),
    ("P 43", "-y,x,z+3/4"),
    ("I 4", "-y,x,z;x+1/2,y+1/2,z+1/2"),
    ("I 41", "-y,x+1/2,z+1/4;x+1/2,y+1/2,z+1/2"),
    ("P -4", "y,-x,-z"),
    ("I -4", "y,-x,-z;x+1/2,y+1/2,z+1/2"),
    ("P 4/m", "-y,x,z;-x,-y,-z"),
    ("P 42/m", "-y,x,z+1/2;-x,-y,-z"),
    ("I 4/m", "-y,x,z;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    ("P 4 2 2", "-y,x,z;-x,y,-z"),
    ("P 4 21 2", "-y+1/2,x+1/2,z;-x+1/2,y+1/2,-z"),
    ("P 41 2 2", "-y,x,z+1/4;-x,y,-z"),
    ("P 41 21 2", "-y+1/2,x+1/2,z+1/4;-x+1/2,y+1/2,-z+1/4"),
    ("P 43 21 2", "-y+1/2,x+1/2,z+3/4;-x+1/2,y+1/2,-z+3/4"),
    ("I 4 2 2", "-y,x,z;-x,y,-z;x+1/2,y+1/2,z+1/2"),
    ("P 4 m m", "-y,x,z;x,-y,z"),
    ("P -4 2 m", "y,-x,-z;-x,y,-z"),
    ("P -4 m 2", "y,-x,-z;x,-y,z"),
    ("P 4/m m m", "-y,x,z;-x,y,-z;-x,-y,-z"),
    ("P 42/m n m", "-y+1/2,x+1/2,z+1/2;-x+1/2,y+1/2,-z+1/2;-x,-y,-z"),
    ("I 4/m m m", "-y,x,z;-x,y,-z;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    // trigonal
    ("P 3", "-y,x-y,z"),
    ("P 31", "-y,x-y,z+1/3"),
    ("P 32", "-y,x-y,z+2/3"),
    ("R 3", "-y,x-y,z;x+2/3,y+1/3,z+1/3"),
    ("P -3", "-y,x-y,z;-x,-y,-z"),
    ("R -3", "-y,x-y,z;-x,-y,-z;x+2/3,y+1/3,z+1/3"),
    ("P 3 1 2", "-y,x-y,z;-y,-x,-z"),
    ("P 3 2 1", "-y,x-y,z;y,x,-z"),
    ("P 31 2 1", "-y,x-y,z+1/3;y,x,-z"),
    ("P 32 2 1", "-y,x-y,z+2/3;y,x,-z"),
    ("R 3 2", "-y,x-y,z;y,x,-z;x+2/3,y+1/3,z+1/3"),
    ("P 3 m 1", "-y,x-y,z;-y,-x,z"),
    ("P 3 1 m", "-y,x-y,z;y,x,z"),
    ("R 3 m", "-y,x-y,z;-y,-x,z;x+2/3,y+1/3,z+1/3"),
    ("R 3 c", "-y,x-y,z;-y,-x,z+1/2;x+2/3,y+1/3,z+1/3"),
    ("P -3 m 1", "-y,x-y,z;y,x,-z;-x,-y,-z"),
    ("R -3 m", "-y,x-y,z;y,x,-z;-x,-y,-z;x+2/3,y+1/3,z+1/3"),
    ("R -3 c", "-y,x-y,z;y,x,-z+1/2;-x,-y,-z;x+2/3,y+1/3,z+1/3"),
    // hexagonal
    ("P 6", "x-y,x,z"),
    ("P 61", "x-y,x,z+1/6"),
    ("P 65", "x-y,x,z+5/6"),
    ("P 62", "x-y,x,z+1/3"),
    ("P 64", "x-y,x,z+2/3"),
    ("P 63", "x-y,x,z+1/2"),
    ("P -6", "x-y,x,-z"),
    ("P 6/m", "x-y,x,z;-x,-y,-z"),
    ("P 63/m", "x-y,x,z+1/2;-x,-y,-z"),
    ("P 6 2 2", "x-y,x,z;y,x,-z"),
    ("P 61 2 2", "x-y,x,z+1/6;y,x,-z+1/3"),
    ("P 65 2 2", "x-y,x,z+5/6;y,x,-z+2/3"),
    ("P 63 2 2", "x-y,x,z+1/2;y,x,-z"),
    ("P 6 m m", "x-y,x,z;-y,-x,z"),
    ("P 63 m c", "x-y,x,z+1/2;-y,-x,z"),
    ("P 63 c m", "x-y,x,z+1/2;-y,-x,z+1/2"),
    ("P 6/m m m", "x-y,x,z;y,x,-z;-x,-y,-z"),
    ("P 63/m m c", "x-y,x,z+1/2;y,x,-z;-x,-y,-z"),
    ("P 63/m c m", "x-y,x,z+1/2;y,x,-z+1/2;-x,-y,-z"),
    // cubic
    ("P 2 3", "-x,-y,z;-x,y,-z;z,x,y"),
    ("F 2 3", "-x,-y,z;-x,y,-z;z,x,y;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I 2 3", "-x,-y,z;-x,y,-z;z,x,y;x+1/2,y+1/2,z+1/2"),
    ("P 21 3", "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;z,x,y"),
    ("I 21 3", "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;z,x,y;x+1/2,y+1/2,z+1/2"),
    ("P m -3", "-x,-y,z;-x,y,-z;z,x,y;-x,-y,-z"),
    ("P a -3", "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;z,x,y;-x,-y,-z"),
    ("I a -3", "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;z,x,y;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    ("F m -3", "-x,-y,z;-x,y,-z;z,x,y;-x,-y,-z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I m -3", "-x,-y,z;-x,y,-z;z,x,y;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    ("P 4 3 2", "z,x,y;-y,x,z"),
    ("P 42 3 2", "z,x,y;-y+1/2,x+1/2,z+1/2"),
    ("F 4 3 2", "z,x,y;-y,x,z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I 4 3 2", "z,x,y;-y,x,z;x+1/2,y+1/2,z+1/2"),
    ("P -4 3 m", "z,x,y;y,x,z"),
    ("F -4 3 m", "z,x,y;y,x,z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    ("I -4 3 m", "z,x,y;y,x,z;x+1/2,y+1/2,z+1/2"),
    ("P -4 3 n", "z,x,y;y+1/2,x+1/2,z+1/2"),
    ("P m -3 m", "z,x,y;-y,x,z;-x,-y,-z"),
    ("P m -3 n", "z,x,y;-y+1/2,x+1/2,z+1/2;-x,-y,-z"),
    ("F m -3 m", "z,x,y;-y,x,z;-x,-y,-z;x,y+1/2,z+1/2;x+1/2,y,z+1/2"),
    (
        "F d -3 m",
        "-x+3/4,-y+1/4,z+1/2;-x+1/4,y+1/2,-z+3/4;z,x,y;y+3/4,x+1/4,-z+1/2;-x,-y,-z;\
         x,y+1/2,z+1/2;x+1/2,y,z+1/2",
    ),
    ("I m -3 m", "z,x,y;-y,x,z;-x,-y,-z;x+1/2,y+1/2,z+1/2"),
    (
        "I a -3 d",
        "-x+1/2,-y,z+1/2;-x,y+1/2,-z+1/2;z,x,y;y+3/4,x+1/4,-z+1/4;-x,-y,-z;\
         x+1/2,y+1/2,z+1/2",
    ),
];

fn squash(symbol: &str) -> String {
    symbol.chars().filter(|c| !c.is_whitespace()).collect()
}

/// A crystallographic space group, generated from its Hermann-Mauguin
/// symbol.
#[derive(Clone, Debug, PartialEq)]
pub struct SpaceGroup {
    symbol: String,
    elements: Vec<SymOp>,
}

impl SpaceGroup {
    /// Look up the symbol (whitespace-insensitive) and generate all coset
    /// representatives by closure over the generator list.
    ///
    /// # Errors
    ///
    /// [`Error::Domain`] for a symbol not in the table or an unparsable
    /// generator string.
    pub fn new(symbol: &str) -> Result<Self> {
        let wanted = squash(symbol);
        let (canonical, generators) = SYMBOL_TABLE
            .iter()
            .find(|(name, _)| squash(name) == wanted)
            .ok_or_else(|| Error::Domain(format!("unknown space group '{symbol}'")))?;

        let mut ops = vec![SymOp::identity()];
        for generator in generators.split(';').filter(|g| !g.is_empty()) {
            ops.push(SymOp::parse(generator)?);
        }

        // closure under composition
        let mut elements = vec![SymOp::identity()];
        let mut grew = true;
        while grew {
            grew = false;
            let snapshot = elements.clone();
            for a in &snapshot {
                for g in &ops {
                    let product = a.compose(g);
                    if !elements.contains(&product) {
                        elements.push(product);
                        grew = true;
                    }
                }
            }
        }

        Ok(Self {
            symbol: (*canonical).to_string(),
            elements,
        })
    }

    /// The canonical symbol from the lookup table.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// All group elements (coset representatives modulo lattice
    /// translations, centring included).
    #[must_use]
    pub fn elements(&self) -> &[SymOp] {
        &self.elements
    }

    /// Group order, i.e. the number of general positions.
    #[must_use]
    pub fn order(&self) -> usize {
        self.elements.len()
    }

    /// Whether the group contains the inversion.
    #[must_use]
    pub fn is_centrosymmetric(&self) -> bool {
        self.elements.iter().any(|g| g.axis_order() == -1)
    }

    /// Bravais letter in `{a, m, o, t, h, c}` derived from the histogram of
    /// rotation orders, the centring count, and centrosymmetry.
    #[must_use]
    pub fn bravais_type(&self) -> char {
        let mut nrot = [0usize; 13];
        let mut n_pure_translations = 0usize;
        let centro = if self.is_centrosymmetric() { 2 } else { 1 };

        for g in &self.elements {
            let idx = usize::try_from(g.axis_order() + 6).expect("axis order in -6..=6");
            nrot[idx] += 1;
            if g.is_pure_translation() {
                n_pure_translations += 1;
            }
        }
        let fact = (1 + n_pure_translations) * centro;

        if nrot[3] + nrot[9] == 8 * fact {
            'c'
        } else if nrot[0] + nrot[12] == 2 * fact || nrot[3] + nrot[9] == 2 * fact {
            'h'
        } else if nrot[2] + nrot[10] == 2 * fact {
            't'
        } else if nrot[4] + nrot[8] == 3 * fact {
            'o'
        } else if nrot[4] + nrot[8] == fact {
            'm'
        } else {
            'a'
        }
    }

    /// Bravais symbol: type letter followed by the centring letter.
    #[must_use]
    pub fn bravais_symbol(&self) -> String {
        let centring = self.symbol.chars().next().expect("nonempty symbol");
        format!("{}{centring}", self.bravais_type())
    }

    /// Whether two reflections are symmetry equivalent, optionally treating
    /// Friedel mates as equivalent even without an inversion in the group.
    #[must_use]
    pub fn is_equivalent(&self, a: &MillerIndex, b: &MillerIndex, friedel: bool) -> bool {
        let ha = a.row_vector();
        let hb = b.row_vector();
        self.elements.iter().any(|g| {
            let image = g.apply_hkl(&ha);
            image == hb || (friedel && -image == hb)
        })
    }

    /// Representative of a reflection's orbit: the lexicographically
    /// maximal image under the group (and Friedel inversion if requested).
    #[must_use]
    pub fn representative(&self, hkl: &MillerIndex, friedel: bool) -> MillerIndex {
        let h = hkl.row_vector();
        let mut best: Option<RowVector3<i32>> = None;
        let mut consider = |candidate: RowVector3<i32>| {
            let better = best.map_or(true, |b| {
                for i in 0..3 {
                    if candidate[i] != b[i] {
                        return candidate[i] > b[i];
                    }
                }
                false
            });
            if better {
                best = Some(candidate);
            }
        };
        for g in &self.elements {
            let image = g.apply_hkl(&h);
            consider(image);
            if friedel {
                consider(-image);
            }
        }
        let best = best.expect("group has at least the identity");
        MillerIndex::new(best[0], best[1], best[2])
    }

    /// Whether a reflection is systematically extinct: the phase sum
    /// `sum(exp(2 pi i t.h))` over the operations whose rotational part
    /// fixes `h` cancels.
    #[must_use]
    pub fn is_extinct(&self, hkl: &MillerIndex) -> bool {
        let h = hkl.row_vector();
        let hf = RowVector3::new(f64::from(h[0]), f64::from(h[1]), f64::from(h[2]));

        let mut re = 0.0;
        let mut im = 0.0;
        let mut fixing = 0usize;
        for g in &self.elements {
            if g.apply_hkl(&h) != h {
                continue;
            }
            fixing += 1;
            let phase = 2.0 * std::f64::consts::PI * hf.dot(&g.translation().transpose());
            re += phase.cos();
            im += phase.sin();
        }
        if fixing == 0 {
            return false;
        }
        (re * re + im * im).sqrt() / (fixing as f64) < EXTINCTION_EPS
    }

    /// Fraction of the given reflections that are extinct.
    #[must_use]
    pub fn fraction_extinct(&self, hkls: &[MillerIndex]) -> f64 {
        if hkls.is_empty() {
            return 0.0;
        }
        let extinct = hkls.iter().filter(|h| self.is_extinct(h)).count();
        extinct as f64 / hkls.len() as f64
    }

    /// All symbols known to the table.
    #[must_use]
    pub fn known_symbols() -> Vec<&'static str> {
        SYMBOL_TABLE.iter().map(|(name, _)| *name).collect()
    }
}

impl fmt::Display for SpaceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_orders() {
        for (symbol, order) in [
            ("P 1", 1),
            ("P -1", 2),
            ("P 21/c", 4),
            ("C 2/c", 8),
            ("P 21 21 21", 4),
            ("P b c a", 8),
            ("P n m a", 8),
            ("I 4/m m m", 32),
            ("P 41 21 2", 8),
            ("R 3", 9),
            ("R -3 c", 36),
            ("P 63/m m c", 24),
            ("P 2 3", 12),
            ("P m -3 m", 48),
            ("F m -3 m", 192),
            ("F d -3 m", 192),
            ("I a -3 d", 96),
        ] {
            let group = SpaceGroup::new(symbol).unwrap();
            assert_eq!(group.order(), order, "order of {symbol}");
        }
    }

    #[test]
    fn closure_under_composition() {
        for symbol in ["P 21/c", "P n m a", "P 41 21 2", "R -3 c", "F d -3 m"] {
            let group = SpaceGroup::new(symbol).unwrap();
            for a in group.elements() {
                for b in group.elements() {
                    let c = a.compose(b);
                    assert!(
                        group.elements().contains(&c),
                        "{symbol} not closed under composition"
                    );
                }
            }
        }
    }

    #[test]
    fn symbol_lookup_ignores_whitespace() {
        assert_eq!(SpaceGroup::new("P21/c").unwrap().symbol(), "P 21/c");
        assert_eq!(SpaceGroup::new("Fd-3m").unwrap().symbol(), "F d -3 m");
        assert!(SpaceGroup::new("Q 5").is_err());
    }

    #[test]
    fn bravais_letters() {
        for (symbol, letter) in [
            ("P -1", 'a'),
            ("P 21/c", 'm'),
            ("P b c a", 'o'),
            ("I 4/m m m", 't'),
            ("P 63/m m c", 'h'),
            ("R -3 c", 'h'),
            ("F m -3 m", 'c'),
        ] {
            let group = SpaceGroup::new(symbol).unwrap();
            assert_eq!(group.bravais_type(), letter, "bravais of {symbol}");
        }
        assert_eq!(SpaceGroup::new("F m -3 m").unwrap().bravais_symbol(), "cF");
    }

    #[test]
    fn diamond_extinctions() {
        let group = SpaceGroup::new("F d -3 m").unwrap();
        assert!(group.is_extinct(&MillerIndex::new(0, 0, 1)));
        assert!(!group.is_extinct(&MillerIndex::new(0, 0, 4)));
        assert!(group.is_extinct(&MillerIndex::new(1, 1, 2)));
        assert!(!group.is_extinct(&MillerIndex::new(1, 1, 3)));
        // 00l with l = 4n only
        assert!(group.is_extinct(&MillerIndex::new(0, 0, 2)));
    }

    #[test]
    fn centred_lattice_extinctions() {
        let group = SpaceGroup::new("I 2 3").unwrap();
        // h + k + l odd is absent for body centring
        assert!(group.is_extinct(&MillerIndex::new(1, 0, 0)));
        assert!(!group.is_extinct(&MillerIndex::new(1, 1, 0)));

        let c2c = SpaceGroup::new("C 2/c").unwrap();
        // h + k odd absent for C centring
        assert!(c2c.is_extinct(&MillerIndex::new(1, 0, 0)));
        // 00l with l odd absent for the c glide
        assert!(c2c.is_extinct(&MillerIndex::new(0, 0, 1)));
        assert!(!c2c.is_extinct(&MillerIndex::new(0, 0, 2)));
    }

    #[test]
    fn screw_axis_extinctions() {
        let group = SpaceGroup::new("P 21 21 21").unwrap();
        assert!(group.is_extinct(&MillerIndex::new(1, 0, 0)));
        assert!(!group.is_extinct(&MillerIndex::new(2, 0, 0)));
        assert!(group.is_extinct(&MillerIndex::new(0, 0, 3)));
        assert!(!group.is_extinct(&MillerIndex::new(1, 1, 1)));
    }

    #[test]
    fn extinction_matches_the_defining_condition() {
        // extinct exactly when some operation fixes h with a fractional
        // phase t.h
        for symbol in ["C 2/c", "P 21 21 21", "I 4/m", "F d -3 m"] {
            let group = SpaceGroup::new(symbol).unwrap();
            for h in -3..=3 {
                for k in -3..=3 {
                    for l in -3..=3 {
                        if h == 0 && k == 0 && l == 0 {
                            continue;
                        }
                        let hkl = MillerIndex::new(h, k, l);
                        let hr = hkl.row_vector();
                        let defining = group.elements().iter().any(|g| {
                            if g.apply_hkl(&hr) != hr {
                                return false;
                            }
                            let phase = f64::from(h) * g.translation()[0]
                                + f64::from(k) * g.translation()[1]
                                + f64::from(l) * g.translation()[2];
                            (phase - phase.round()).abs() > 1e-6
                        });
                        assert_eq!(
                            group.is_extinct(&hkl),
                            defining,
                            "{symbol} at ({h} {k} {l})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn equivalence_and_representative() {
        let group = SpaceGroup::new("P 4/m m m").unwrap();
        let a = MillerIndex::new(1, 2, 3);
        let b = MillerIndex::new(2, 1, 3);
        let c = MillerIndex::new(1, 2, 4);
        assert!(group.is_equivalent(&a, &b, false));
        assert!(!group.is_equivalent(&a, &c, false));

        let rep_a = group.representative(&a, false);
        let rep_b = group.representative(&b, false);
        assert_eq!(rep_a, rep_b);
        assert_eq!(rep_a, MillerIndex::new(2, 1, 3));
    }

    #[test]
    fn friedel_equivalence_without_inversion() {
        let group = SpaceGroup::new("P 1").unwrap();
        let a = MillerIndex::new(1, 2, 3);
        let minus = MillerIndex::new(-1, -2, -3);
        assert!(!group.is_equivalent(&a, &minus, false));
        assert!(group.is_equivalent(&a, &minus, true));
    }
}
