//! CSIDH-512 commutative isogeny key exchange.
//!
//! Keys live in the class group acting on supersingular Montgomery curves
//! `y^2 = x^3 + A x^2 + x` over `F_p`, with `p = 4 * l_1 * ... * l_74 - 1`.
//! A private key is a vector of 74 exponents in `[-5, 5]`; applying it walks
//! `e_i` steps of the `l_i`-isogeny graph. The action commutes, which makes
//! `priv_a * (priv_b * E_0) == priv_b * (priv_a * E_0)` the shared secret.
//!
//! Points are kept in projective `(X : Z)` coordinates so the Montgomery
//! ladder and Velu-style isogeny evaluation need one inversion per step.
//!
//! The point sampler is a ChaCha20 stream seeded from the private key and the
//! input curve, so a given `(private, public)` pair always takes the same
//! path. Timing is not constant.

use std::{fmt, sync::LazyLock};

use num_bigint::BigUint;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{Nike, NikePrivateKey, NikePublicKey, check_len};
use crate::{error::CryptoError, hash::blake2b_256};

const SCHEME: &str = "csidh-512";

/// Number of small primes (and private exponents).
const NUM_PRIMES: usize = 74;

/// Exponent bound: each `e_i` lies in `[-BOUND, BOUND]`.
const BOUND: i8 = 5;

/// Points tried before an inconclusive curve is rejected.
const VALIDATION_ATTEMPTS: usize = 16;

/// Encoded field element width.
const FIELD_BYTES: usize = 64;

/// The first 73 odd primes and 587.
const PRIMES: [u64; NUM_PRIMES] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191, 193,
    197, 199, 211, 223, 227, 229, 233, 239, 241, 251, 257, 263, 269, 271, 277, 281, 283, 293, 307,
    311, 313, 317, 331, 337, 347, 349, 353, 359, 367, 373, 587,
];

struct Field {
    p: BigUint,
    p_plus_one: BigUint,
    p_minus_two: BigUint,
    legendre_exp: BigUint,
    inv4: BigUint,
    /// `4 sqrt(p)`: a point order above this proves supersingularity
    order_bound: BigUint,
}

static FIELD: LazyLock<Field> = LazyLock::new(|| {
    let product = PRIMES.iter().fold(one(), |acc, &l| acc * l);
    let p = product * 4u32 - 1u32;
    let p_plus_one = &p + 1u32;
    Field {
        p_minus_two: &p - 2u32,
        legendre_exp: (&p - 1u32) >> 1,
        inv4: &p_plus_one >> 2,
        order_bound: (p.sqrt() + 1u32) * 4u32,
        p_plus_one,
        p,
    }
});

fn zero() -> BigUint {
    BigUint::from(0u8)
}

fn one() -> BigUint {
    BigUint::from(1u8)
}

fn is_zero(a: &BigUint) -> bool {
    a.bits() == 0
}

fn f_add(a: &BigUint, b: &BigUint) -> BigUint {
    let sum = a + b;
    if sum >= FIELD.p { sum - &FIELD.p } else { sum }
}

fn f_sub(a: &BigUint, b: &BigUint) -> BigUint {
    if a >= b { a - b } else { &FIELD.p - (b - a) }
}

fn f_mul(a: &BigUint, b: &BigUint) -> BigUint {
    (a * b) % &FIELD.p
}

fn f_sqr(a: &BigUint) -> BigUint {
    f_mul(a, a)
}

fn f_pow(a: &BigUint, e: &BigUint) -> BigUint {
    a.modpow(e, &FIELD.p)
}

fn f_inv(a: &BigUint) -> BigUint {
    f_pow(a, &FIELD.p_minus_two)
}

/// Projective x-only point `(X : Z)`.
#[derive(Clone)]
struct Point {
    x: BigUint,
    z: BigUint,
}

impl Point {
    fn infinity() -> Self {
        Self { x: one(), z: zero() }
    }

    fn is_infinity(&self) -> bool {
        is_zero(&self.z)
    }
}

/// `(A + 2) / 4`, the ladder constant for curve coefficient `a`.
fn a24(a: &BigUint) -> BigUint {
    f_mul(&f_add(a, &BigUint::from(2u8)), &FIELD.inv4)
}

fn x_dbl(point: &Point, a24: &BigUint) -> Point {
    let t0 = f_sqr(&f_add(&point.x, &point.z));
    let t1 = f_sqr(&f_sub(&point.x, &point.z));
    let t = f_sub(&t0, &t1);
    Point { x: f_mul(&t0, &t1), z: f_mul(&t, &f_add(&t1, &f_mul(a24, &t))) }
}

/// `P + Q` given `D = P - Q`.
fn x_add(p: &Point, q: &Point, diff: &Point) -> Point {
    let u = f_mul(&f_sub(&p.x, &p.z), &f_add(&q.x, &q.z));
    let v = f_mul(&f_add(&p.x, &p.z), &f_sub(&q.x, &q.z));
    Point { x: f_mul(&diff.z, &f_sqr(&f_add(&u, &v))), z: f_mul(&diff.x, &f_sqr(&f_sub(&u, &v))) }
}

fn ladder(k: &BigUint, point: &Point, a24: &BigUint) -> Point {
    let mut r0 = Point::infinity();
    let mut r1 = point.clone();
    for i in (0..k.bits()).rev() {
        if k.bit(i) {
            r0 = x_add(&r0, &r1, point);
            r1 = x_dbl(&r1, a24);
        } else {
            r1 = x_add(&r0, &r1, point);
            r0 = x_dbl(&r0, a24);
        }
    }
    r0
}

/// Apply the degree-`l` isogeny with kernel generated by `kernel` to the
/// curve `a` and push `q` through it.
fn isogeny(a: &BigUint, kernel: &Point, l: u64, q: &Point) -> (BigUint, Point) {
    let a24 = a24(a);
    let half = ((l - 1) / 2) as usize;

    let mut multiples = Vec::with_capacity(half);
    multiples.push(kernel.clone());
    if half >= 2 {
        multiples.push(x_dbl(kernel, &a24));
    }
    for i in 2..half {
        let next = x_add(&multiples[i - 1], kernel, &multiples[i - 2]);
        multiples.push(next);
    }

    let (mut px, mut pz) = (one(), one());
    let (mut qx, mut qz) = (one(), one());
    for m in &multiples {
        px = f_mul(&px, &f_sub(&m.x, &m.z));
        pz = f_mul(&pz, &f_add(&m.x, &m.z));
        qx = f_mul(&qx, &f_sqr(&f_sub(&f_mul(&q.x, &m.x), &f_mul(&q.z, &m.z))));
        qz = f_mul(&qz, &f_sqr(&f_sub(&f_mul(&q.x, &m.z), &f_mul(&q.z, &m.x))));
    }

    let degree = BigUint::from(l);
    let eight = BigUint::from(8u8);
    let two = BigUint::from(2u8);
    let num = f_mul(&f_pow(&f_add(a, &two), &degree), &f_pow(&pz, &eight));
    let den = f_mul(&f_pow(&f_sub(a, &two), &degree), &f_pow(&px, &eight));
    let image = f_mul(&f_mul(&two, &f_add(&num, &den)), &f_inv(&f_sub(&num, &den)));

    (image, Point { x: f_mul(&q.x, &qx), z: f_mul(&q.z, &qz) })
}

fn random_element(rng: &mut ChaCha20Rng) -> BigUint {
    loop {
        let mut bytes = [0u8; FIELD_BYTES];
        rng.fill_bytes(&mut bytes);
        let x = BigUint::from_bytes_le(&bytes) % &FIELD.p;
        if !is_zero(&x) {
            return x;
        }
    }
}

/// Class group action of `exponents` on the curve with coefficient `a`.
fn act(a: &BigUint, exponents: &[i8; NUM_PRIMES], rng: &mut ChaCha20Rng) -> BigUint {
    let mut a = a.clone();
    let mut remaining = *exponents;
    let unity = one();

    while remaining.iter().any(|&e| e != 0) {
        let x = random_element(rng);
        let x2 = f_sqr(&x);
        let rhs = f_add(&f_add(&f_mul(&x2, &x), &f_mul(&a, &x2)), &x);
        if is_zero(&rhs) {
            continue;
        }
        let sign: i8 = if f_pow(&rhs, &FIELD.legendre_exp) == unity { 1 } else { -1 };

        let selected: Vec<usize> =
            (0..NUM_PRIMES).filter(|&i| remaining[i] != 0 && remaining[i].signum() == sign).collect();
        if selected.is_empty() {
            continue;
        }

        let mut k = selected.iter().fold(one(), |acc, &i| acc * PRIMES[i]);
        let mut q = ladder(&(&FIELD.p_plus_one / &k), &Point { x, z: one() }, &a24(&a));

        for &i in &selected {
            let cofactor = &k / PRIMES[i];
            let kernel = ladder(&cofactor, &q, &a24(&a));
            if !kernel.is_infinity() {
                (a, q) = isogeny(&a, &kernel, PRIMES[i], &q);
                remaining[i] -= sign;
            }
            k = cofactor;
        }
    }
    a
}

/// Whether the curve with coefficient `a` is supersingular.
///
/// A point whose order divides `p + 1` and exceeds `4 sqrt(p)` exists only on
/// supersingular curves. Points of smaller order are resampled.
fn is_supersingular(a: &BigUint) -> bool {
    if is_zero(a) {
        return true;
    }
    let a24 = a24(a);
    let curve_bytes = encode(a);
    let mut rng = ChaCha20Rng::from_seed(blake2b_256(&[&b"csidh-validate"[..], &curve_bytes[..]]));

    for _ in 0..VALIDATION_ATTEMPTS {
        let point = Point { x: random_element(&mut rng), z: one() };
        let q = ladder(&BigUint::from(4u8), &point, &a24);
        let mut order = one();
        if !torsion_order(&q, &PRIMES, &a24, &mut order) {
            return false;
        }
        if order > FIELD.order_bound {
            return true;
        }
    }
    false
}

/// Multiply into `order` each prime of `primes` that divides the order of
/// `q`. Returns false if that order does not divide the product of `primes`.
fn torsion_order(q: &Point, primes: &[u64], a24: &BigUint, order: &mut BigUint) -> bool {
    if q.is_infinity() {
        return true;
    }
    if let [l] = primes {
        if !ladder(&BigUint::from(*l), q, a24).is_infinity() {
            return false;
        }
        *order *= *l;
        return true;
    }

    let (left, right) = primes.split_at(primes.len() / 2);
    let product = |part: &[u64]| part.iter().fold(one(), |acc, &l| acc * l);
    torsion_order(&ladder(&product(right), q, a24), left, a24, order)
        && torsion_order(&ladder(&product(left), q, a24), right, a24, order)
}

fn sampler(private: &CsidhPrivateKey, curve: &BigUint) -> ChaCha20Rng {
    let private_bytes = private.to_bytes();
    let curve_bytes = encode(curve);
    ChaCha20Rng::from_seed(blake2b_256(&[&private_bytes[..], &curve_bytes[..]]))
}

fn encode(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(FIELD_BYTES, 0);
    bytes
}

/// Post-quantum isogeny scheme.
#[derive(Debug, Clone, Copy)]
pub struct Csidh512;

/// Montgomery coefficient `A` of a supersingular curve.
#[derive(Clone, PartialEq, Eq)]
pub struct CsidhPublicKey(BigUint);

/// Exponent vector.
#[derive(Clone)]
pub struct CsidhPrivateKey(Zeroizing<[i8; NUM_PRIMES]>);

impl fmt::Debug for CsidhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = encode(&self.0);
        write!(f, "CsidhPublicKey({:02x}{:02x}{:02x}{:02x}..)", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl NikePublicKey for CsidhPublicKey {
    fn to_bytes(&self) -> Vec<u8> {
        encode(&self.0)
    }

    fn ct_eq(&self, other: &Self) -> bool {
        self.to_bytes().ct_eq(&other.to_bytes()).into()
    }
}

impl NikePrivateKey for CsidhPrivateKey {
    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.iter().map(|&e| e as u8).collect())
    }

    fn ct_eq(&self, other: &Self) -> bool {
        self.to_bytes().ct_eq(&other.to_bytes()).into()
    }
}

impl Nike for Csidh512 {
    type PublicKey = CsidhPublicKey;
    type PrivateKey = CsidhPrivateKey;

    const NAME: &'static str = SCHEME;
    const PUBLIC_KEY_SIZE: usize = FIELD_BYTES;
    const PRIVATE_KEY_SIZE: usize = NUM_PRIMES;
    const SECRET_SIZE: usize = FIELD_BYTES;

    fn new_keypair<R: RngCore + CryptoRng + ?Sized>(
        rng: &mut R,
    ) -> (Self::PrivateKey, Self::PublicKey) {
        let span = (2 * BOUND + 1) as u8;
        // Largest multiple of `span` that fits in a byte, for unbiased sampling.
        let limit = u8::MAX - (u8::MAX % span);

        let mut exponents = Zeroizing::new([0i8; NUM_PRIMES]);
        let mut filled = 0;
        let mut buf = [0u8; 32];
        while filled < NUM_PRIMES {
            rng.fill_bytes(&mut buf);
            for &byte in buf.iter().filter(|&&b| b < limit) {
                if filled == NUM_PRIMES {
                    break;
                }
                exponents[filled] = (byte % span) as i8 - BOUND;
                filled += 1;
            }
        }
        buf.fill(0);

        let private = CsidhPrivateKey(exponents);
        let public = Self::derive_public_key(&private);
        (private, public)
    }

    fn derive_public_key(private: &Self::PrivateKey) -> Self::PublicKey {
        let base = zero();
        let mut rng = sampler(private, &base);
        CsidhPublicKey(act(&base, &private.0, &mut rng))
    }

    fn derive_secret(private: &Self::PrivateKey, public: &Self::PublicKey) -> Zeroizing<Vec<u8>> {
        let mut rng = sampler(private, &public.0);
        Zeroizing::new(encode(&act(&public.0, &private.0, &mut rng)))
    }

    fn public_key_from_bytes(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError> {
        check_len(SCHEME, "public", bytes, FIELD_BYTES)?;
        let a = BigUint::from_bytes_le(bytes);

        let reject = |reason: &str| CryptoError::InvalidKey {
            scheme: SCHEME,
            kind: "public",
            reason: reason.to_string(),
        };
        if a >= FIELD.p {
            return Err(reject("coefficient not reduced mod p"));
        }
        if a == BigUint::from(2u8) || a == &FIELD.p - 2u32 {
            return Err(reject("singular curve"));
        }
        if !is_supersingular(&a) {
            return Err(reject("curve is not supersingular"));
        }
        Ok(CsidhPublicKey(a))
    }

    fn private_key_from_bytes(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError> {
        check_len(SCHEME, "private", bytes, NUM_PRIMES)?;
        let mut exponents = Zeroizing::new([0i8; NUM_PRIMES]);
        for (slot, &byte) in exponents.iter_mut().zip(bytes) {
            let e = byte as i8;
            if !(-BOUND..=BOUND).contains(&e) {
                return Err(CryptoError::InvalidKey {
                    scheme: SCHEME,
                    kind: "private",
                    reason: format!("exponent {e} outside [-{BOUND}, {BOUND}]"),
                });
            }
            *slot = e;
        }
        Ok(CsidhPrivateKey(exponents))
    }
}
