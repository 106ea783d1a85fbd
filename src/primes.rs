//! Bucket array sizing.
//!
//! Bucket arrays are always sized from an ascending table of primes so that
//! `hash % len` spreads keys well even when the hash has weak low bits. The
//! last entry, `i32::MAX`, caps growth.

/// Ascending bucket array sizes, roughly 9% apart above 100.
static PRIMES: &[usize] = &[
    2, 3, 5, 7, 11, 13, 17, 19,
    23, 29, 31, 37, 41, 43, 47, 53,
    59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 113, 127, 139, 151, 167, 191,
    211, 229, 251, 277, 307, 337, 367, 401,
    439, 479, 523, 571, 631, 691, 757, 827,
    907, 991, 1_087, 1_187, 1_297, 1_423, 1_553, 1_693,
    1_847, 2_017, 2_203, 2_411, 2_633, 2_879, 3_163, 3_449,
    3_761, 4_099, 4_481, 4_889, 5_333, 5_813, 6_337, 6_907,
    7_529, 8_209, 8_951, 9_767, 10_651, 11_617, 12_671, 13_829,
    15_073, 16_433, 17_911, 19_531, 21_313, 23_251, 25_343, 27_631,
    30_119, 32_831, 35_797, 39_019, 42_533, 46_381, 50_581, 55_147,
    60_127, 65_539, 71_437, 77_867, 84_913, 92_557, 100_907, 110_017,
    119_921, 130_729, 142_501, 155_327, 169_307, 184_553, 201_163, 219_277,
    239_017, 260_539, 284_003, 309_571, 337_453, 367_823, 400_927, 437_011,
    476_347, 519_227, 565_973, 616_933, 672_473, 732_997, 799_003, 870_917,
    949_303, 1_034_767, 1_127_911, 1_229_443, 1_340_107, 1_460_729, 1_592_197, 1_735_499,
    1_891_711, 2_061_967, 2_247_559, 2_449_847, 2_670_337, 2_910_671, 3_172_649, 3_458_201,
    3_769_439, 4_108_717, 4_478_527, 4_881_623, 5_320_999, 5_799_929, 6_321_947, 6_890_957,
    7_511_149, 8_187_163, 8_924_011, 9_727_181, 10_602_629, 11_556_907, 12_597_029, 13_730_767,
    14_966_543, 16_313_537, 17_781_761, 19_382_119, 21_126_517, 23_027_909, 25_100_423, 27_359_471,
    29_821_843, 32_505_829, 35_431_367, 38_620_201, 42_096_037, 45_884_711, 50_014_337, 54_515_633,
    59_422_043, 64_770_049, 70_599_359, 76_953_307, 83_879_123, 91_428_299, 99_656_857, 108_626_003,
    118_402_343, 129_058_591, 140_673_881, 153_334_553, 167_134_663, 182_176_843, 198_572_761, 216_444_337,
    235_924_331, 257_157_553, 280_301_837, 305_529_011, 333_026_669, 362_999_071, 395_669_003, 431_279_237,
    470_094_389, 512_402_897, 558_519_191, 608_785_927, 663_576_679, 723_298_619, 788_395_501, 859_351_099,
    936_692_717, 1_020_995_071, 1_112_884_687, 1_213_044_331, 1_322_218_369, 1_441_218_041, 1_570_927_679, 1_712_311_253,
    1_866_419_281, 2_034_397_033, 2_147_483_647,
];

/// The largest bucket array a map will ever grow to.
pub const MAX_BUCKETS: usize = 2_147_483_647;

/// Smallest tabled prime that is `>= n`, or [`MAX_BUCKETS`] when `n` is
/// beyond the table.
pub fn ceil_prime(n: usize) -> usize {
    match PRIMES.binary_search(&n) {
        Ok(i) => PRIMES[i],
        Err(i) => PRIMES.get(i).copied().unwrap_or(MAX_BUCKETS),
    }
}

/// Size of the bucket array that replaces one of `current` buckets.
///
/// Returns `current` unchanged once the cap has been reached, which callers
/// treat as "no growth possible".
pub fn next_size(current: usize, growth_rate: f32) -> usize {
    if current >= MAX_BUCKETS {
        return MAX_BUCKETS;
    }
    let target = (current as f64 * (1.0 + growth_rate as f64)).ceil();
    let target = if target >= MAX_BUCKETS as f64 {
        MAX_BUCKETS
    } else {
        (target as usize).max(current + 1)
    };
    ceil_prime(target)
}
