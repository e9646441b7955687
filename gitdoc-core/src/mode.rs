//! Tree entry modes.
//!
//! Git prints entry modes in octal (`100644`, `040000`, ...). Documents
//! store them in `ls -l` style so that viewers can show them directly:
//! the first character is the entry type and the remaining nine are the
//! permission bits. The two forms convert into each other exactly.

use crate::error::ModelError;

const TYPE_MASK: u32 = 0o170000;
const PERM_MASK: u32 = 0o777;

const TYPES: [(u32, char); 4] = [
    (0o040000, 'd'),
    (0o100000, '-'),
    (0o120000, 'l'),
    (0o160000, 'm'),
];

/// `100644` -> `-rw-r--r--`
pub fn octal_to_symbolic(octal: &str) -> Result<String, ModelError> {
    let invalid = || ModelError::InvalidMode(octal.to_string());
    let bits = u32::from_str_radix(octal, 8).map_err(|_| invalid())?;
    if bits & !(TYPE_MASK | PERM_MASK) != 0 {
        return Err(invalid());
    }
    let type_char = TYPES
        .iter()
        .find(|(t, _)| *t == bits & TYPE_MASK)
        .map(|(_, c)| *c)
        .ok_or_else(invalid)?;

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let triple = (bits >> shift) & 0o7;
        out.push(if triple & 0o4 != 0 { 'r' } else { '-' });
        out.push(if triple & 0o2 != 0 { 'w' } else { '-' });
        out.push(if triple & 0o1 != 0 { 'x' } else { '-' });
    }
    Ok(out)
}

/// `-rwxr-xr-x` -> `100755`
pub fn symbolic_to_octal(symbolic: &str) -> Result<String, ModelError> {
    let invalid = || ModelError::InvalidMode(symbolic.to_string());
    let chars: Vec<char> = symbolic.chars().collect();
    if chars.len() != 10 {
        return Err(invalid());
    }
    let mut bits = TYPES
        .iter()
        .find(|(_, c)| *c == chars[0])
        .map(|(t, _)| *t)
        .ok_or_else(invalid)?;

    for (i, c) in chars[1..].iter().enumerate() {
        let (flag, bit) = match i % 3 {
            0 => ('r', 0o4),
            1 => ('w', 0o2),
            _ => ('x', 0o1),
        };
        let shift = 6 - 3 * (i as u32 / 3);
        if *c == flag {
            bits |= bit << shift;
        } else if *c != '-' {
            return Err(invalid());
        }
    }
    Ok(format!("{:06o}", bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_modes() {
        assert_eq!(octal_to_symbolic("100644").unwrap(), "-rw-r--r--");
        assert_eq!(octal_to_symbolic("100755").unwrap(), "-rwxr-xr-x");
        assert_eq!(octal_to_symbolic("040000").unwrap(), "d---------");
        assert_eq!(octal_to_symbolic("120000").unwrap(), "l---------");
        assert_eq!(octal_to_symbolic("160000").unwrap(), "m---------");
    }

    #[test]
    fn test_back_to_octal() {
        for mode in ["100644", "100755", "040000", "120000", "160000"] {
            let symbolic = octal_to_symbolic(mode).unwrap();
            assert_eq!(symbolic_to_octal(&symbolic).unwrap(), mode);
        }
    }

    #[test]
    fn test_invalid_modes() {
        assert!(octal_to_symbolic("999").is_err());
        assert!(octal_to_symbolic("104755").is_err());
        assert!(octal_to_symbolic("200644").is_err());
        assert!(symbolic_to_octal("-rw-r--r").is_err());
        assert!(symbolic_to_octal("?rw-r--r--").is_err());
        assert!(symbolic_to_octal("-rq-r--r--").is_err());
    }
}
