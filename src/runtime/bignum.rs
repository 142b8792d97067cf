//! Arbitrary-precision decimal integers for the `bignumber` type.
//!
//! Big numbers live in the heap as character arrays holding their decimal
//! text, so the natives parse, compute and format back. Division truncates
//! toward zero and the remainder takes the dividend's sign, like the
//! integer operators.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigNum {
    negative: bool,
    /// Least significant digit first, no trailing zeros. Zero is empty.
    digits: Vec<u8>,
}

impl BigNum {
    pub fn zero() -> Self {
        BigNum {
            negative: false,
            digits: Vec::new(),
        }
    }

    /// Parses optional sign and decimal digits, surrounding blanks allowed.
    /// Anything else is `None`.
    pub fn parse(text: &str) -> Option<BigNum> {
        let text = text.trim();
        let (negative, body) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = body.bytes().rev().map(|b| b - b'0').collect();
        Some(BigNum { negative, digits }.normalized())
    }

    pub fn from_i64(value: i64) -> Self {
        BigNum::parse(&value.to_string()).unwrap_or_else(BigNum::zero)
    }

    pub fn is_zero(&self) -> bool {
        self.digits.is_empty()
    }

    fn normalized(mut self) -> Self {
        while self.digits.last() == Some(&0) {
            self.digits.pop();
        }
        if self.digits.is_empty() {
            self.negative = false;
        }
        self
    }

    pub fn add(&self, other: &BigNum) -> BigNum {
        if self.negative == other.negative {
            return BigNum {
                negative: self.negative,
                digits: add_magnitude(&self.digits, &other.digits),
            }
            .normalized();
        }
        match cmp_magnitude(&self.digits, &other.digits) {
            Ordering::Less => BigNum {
                negative: other.negative,
                digits: sub_magnitude(&other.digits, &self.digits),
            },
            _ => BigNum {
                negative: self.negative,
                digits: sub_magnitude(&self.digits, &other.digits),
            },
        }
        .normalized()
    }

    pub fn sub(&self, other: &BigNum) -> BigNum {
        let negated = BigNum {
            negative: !other.negative,
            digits: other.digits.clone(),
        }
        .normalized();
        self.add(&negated)
    }

    pub fn mul(&self, other: &BigNum) -> BigNum {
        if self.is_zero() || other.is_zero() {
            return BigNum::zero();
        }
        let mut acc = vec![0u32; self.digits.len() + other.digits.len()];
        for (i, &a) in self.digits.iter().enumerate() {
            let mut carry = 0u32;
            for (j, &b) in other.digits.iter().enumerate() {
                let cell = acc[i + j] + a as u32 * b as u32 + carry;
                acc[i + j] = cell % 10;
                carry = cell / 10;
            }
            let mut k = i + other.digits.len();
            while carry > 0 {
                let cell = acc[k] + carry;
                acc[k] = cell % 10;
                carry = cell / 10;
                k += 1;
            }
        }
        BigNum {
            negative: self.negative != other.negative,
            digits: acc.into_iter().map(|d| d as u8).collect(),
        }
        .normalized()
    }

    /// Quotient and remainder, `None` when dividing by zero.
    pub fn div_rem(&self, other: &BigNum) -> Option<(BigNum, BigNum)> {
        if other.is_zero() {
            return None;
        }
        let mut quotient = vec![0u8; self.digits.len()];
        let mut rem: Vec<u8> = Vec::new();
        for i in (0..self.digits.len()).rev() {
            rem.insert(0, self.digits[i]);
            while rem.last() == Some(&0) {
                rem.pop();
            }
            let mut q = 0;
            while cmp_magnitude(&rem, &other.digits) != Ordering::Less {
                rem = sub_magnitude(&rem, &other.digits);
                while rem.last() == Some(&0) {
                    rem.pop();
                }
                q += 1;
            }
            quotient[i] = q;
        }
        let q = BigNum {
            negative: self.negative != other.negative,
            digits: quotient,
        }
        .normalized();
        let r = BigNum {
            negative: self.negative,
            digits: rem,
        }
        .normalized();
        Some((q, r))
    }
}

impl Ord for BigNum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => cmp_magnitude(&self.digits, &other.digits),
            (true, true) => cmp_magnitude(&other.digits, &self.digits),
        }
    }
}

impl PartialOrd for BigNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BigNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.digits.is_empty() {
            return write!(f, "0");
        }
        if self.negative {
            write!(f, "-")?;
        }
        for d in self.digits.iter().rev() {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

fn cmp_magnitude(a: &[u8], b: &[u8]) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.iter().rev().cmp(b.iter().rev()))
}

fn add_magnitude(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0;
    for i in 0..a.len().max(b.len()) {
        let sum = a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0) + carry;
        out.push(sum % 10);
        carry = sum / 10;
    }
    if carry > 0 {
        out.push(carry);
    }
    out
}

/// `a - b` for `a >= b`.
fn sub_magnitude(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i8;
    for i in 0..a.len() {
        let mut d = a[i] as i8 - borrow - b.get(i).copied().unwrap_or(0) as i8;
        borrow = 0;
        if d < 0 {
            d += 10;
            borrow = 1;
        }
        out.push(d as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(s: &str) -> BigNum {
        BigNum::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(big("000123").to_string(), "123");
        assert_eq!(big("-0").to_string(), "0");
        assert_eq!(big(" +42 ").to_string(), "42");
        assert!(BigNum::parse("12a").is_none());
        assert!(BigNum::parse("").is_none());
    }

    #[test]
    fn test_add_and_sub_with_signs() {
        assert_eq!(big("999").add(&big("1")).to_string(), "1000");
        assert_eq!(big("5").sub(&big("8")).to_string(), "-3");
        assert_eq!(big("-5").add(&big("5")).to_string(), "0");
        assert_eq!(big("-7").sub(&big("-10")).to_string(), "3");
    }

    #[test]
    fn test_mul_beyond_i64() {
        let a = big("123456789012345678901234567890");
        assert_eq!(
            a.mul(&big("-1000000000")).to_string(),
            "-123456789012345678901234567890000000000"
        );
        assert_eq!(big("99999999999").mul(&big("99999999999")).to_string(), "9999999999800000000001");
    }

    #[test]
    fn test_div_rem_truncates() {
        let (q, r) = big("100").div_rem(&big("7")).unwrap();
        assert_eq!((q.to_string(), r.to_string()), ("14".into(), "2".into()));
        let (q, r) = big("-100").div_rem(&big("7")).unwrap();
        assert_eq!((q.to_string(), r.to_string()), ("-14".into(), "-2".into()));
        assert!(big("1").div_rem(&BigNum::zero()).is_none());
    }

    #[test]
    fn test_ordering() {
        assert!(big("-10") < big("-9"));
        assert!(big("10") > big("9"));
        assert!(big("-1") < big("0"));
        assert_eq!(big("12").cmp(&big("12")), Ordering::Equal);
    }
}
