// Per-driver rules for pairing hwmon voltage channels with current
// channels when a board monitor exposes no direct power sensor. The
// entries encode the channel layout documented for each kernel driver;
// indexes refer to the `inN` / `currN` sysfs numbers.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// How one hwmon driver family pairs its voltage and current channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChipRule {
    /// Explicit `(voltage index, current index)` pairings.
    pub pairs: &'static [(u32, u32)],
    /// Pair `inN` with `currN` for every index present on both sides.
    pub same_index: bool,
    /// Voltage channels that must never be paired (shunt voltages,
    /// ADC auxiliaries, ...).
    pub skip_voltages: &'static [u32],
    /// Current channels that must never be paired.
    pub skip_currents: &'static [u32],
}

const SAME_INDEX: ChipRule = ChipRule {
    pairs: &[],
    same_index: true,
    skip_voltages: &[],
    skip_currents: &[],
};

/// `in1` is the bus voltage, `curr1` the bus current; `in0` is the
/// shunt voltage and must not enter a power product.
const BUS_RAIL: ChipRule = ChipRule {
    pairs: &[(1, 1)],
    same_index: false,
    skip_voltages: &[0],
    skip_currents: &[],
};

/// `in1` = VIN, `curr1` the load current.
const VIN_RAIL: ChipRule = ChipRule {
    pairs: &[(1, 1)],
    same_index: false,
    skip_voltages: &[],
    skip_currents: &[],
};

/// `curr1` measures the output, so it pairs with VOUT (`in2`), not
/// VIN (`in1`).
const VOUT_RAIL: ChipRule = ChipRule {
    pairs: &[(2, 1)],
    same_index: false,
    skip_voltages: &[],
    skip_currents: &[],
};

/// VIN/IIN on channel 1, VOUT/IOUT on channel 2.
const IN_OUT_RAILS: ChipRule = ChipRule {
    pairs: &[(1, 1), (2, 2)],
    same_index: false,
    skip_voltages: &[],
    skip_currents: &[],
};

static CHIP_RULES: Lazy<HashMap<&'static str, ChipRule>> = Lazy::new(|| {
    let mut rules: HashMap<&'static str, ChipRule> = HashMap::new();

    rules.insert("ina219", BUS_RAIL);
    rules.insert("ina226", BUS_RAIL);
    rules.insert("ina238", BUS_RAIL);
    rules.insert("ina233", BUS_RAIL);
    rules.insert("ina260", VIN_RAIL);
    // Channels 4..7 are the per-channel shunt voltages and their sum.
    rules.insert(
        "ina3221",
        ChipRule {
            pairs: &[],
            same_index: true,
            skip_voltages: &[4, 5, 6, 7],
            skip_currents: &[],
        },
    );

    rules.insert("ltc2945", VIN_RAIL);
    rules.insert("ltc2947", SAME_INDEX);
    // Two supplies on channels 1 and 2; in3..in6 are GPIO ADC inputs.
    rules.insert(
        "ltc2992",
        ChipRule {
            pairs: &[(1, 1), (2, 2)],
            same_index: false,
            skip_voltages: &[3, 4, 5, 6],
            skip_currents: &[],
        },
    );
    rules.insert("ltc4260", VIN_RAIL);
    rules.insert("ltc4261", VIN_RAIL);
    rules.insert("ltc4282", VIN_RAIL);

    rules.insert("adm1275", VIN_RAIL);
    rules.insert("adm1276", VIN_RAIL);
    rules.insert("adm1278", VIN_RAIL);
    rules.insert("adm1293", VIN_RAIL);

    // curr1 is the output current on these regulators; pairing it with
    // VIN would overstate the rail power by the conversion ratio.
    rules.insert("max20730", VOUT_RAIL);
    rules.insert("max20751", VOUT_RAIL);
    // curr7/curr8 are current-only monitoring channels without a
    // matching voltage rail.
    rules.insert(
        "max34440",
        ChipRule {
            pairs: &[],
            same_index: true,
            skip_voltages: &[],
            skip_currents: &[7, 8],
        },
    );
    rules.insert("max34451", SAME_INDEX);

    rules.insert("tps40422", IN_OUT_RAILS);
    rules.insert("tps53679", IN_OUT_RAILS);
    rules.insert("tps546d24", VOUT_RAIL);

    rules.insert("ir35221", SAME_INDEX);
    rules.insert("xdpe12284", IN_OUT_RAILS);
    // curr2..curr8 are per-phase outputs already summed into curr1.
    rules.insert(
        "mp2975",
        ChipRule {
            pairs: &[(1, 1)],
            same_index: false,
            skip_voltages: &[],
            skip_currents: &[2, 3, 4, 5, 6, 7, 8],
        },
    );

    rules.insert("pmbus", SAME_INDEX);
    rules.insert("ucd9000", SAME_INDEX);
    rules.insert("ucd90320", SAME_INDEX);

    rules
});

/// Looks up the pairing rule for a normalized chip name. Falls back to
/// a prefix match so decorated names (`ina226_1`, `ucd90320a`) still
/// resolve.
pub fn rule_for(chip: &str) -> Option<&'static ChipRule> {
    if let Some(rule) = CHIP_RULES.get(chip) {
        return Some(rule);
    }
    CHIP_RULES
        .iter()
        .filter(|(key, _)| chip.starts_with(*key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, rule)| rule)
}
