use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::Path,
};

use bincode::{config, Decode, Encode};

/// Save to file, using Bincode.
pub fn save<T: Encode>(path: &Path, data: &T) -> io::Result<()> {
    let encoded = bincode::encode_to_vec(data, config::standard())
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;

    let mut file = File::create(path)?;
    file.write_all(&encoded)?;
    Ok(())
}

/// Load from file, using Bincode.
pub fn load<T: Decode<()>>(path: &Path) -> io::Result<T> {
    let mut buffer = Vec::new();
    let mut file = File::open(path)?;
    file.read_to_end(&mut buffer)?;

    let (decoded, _len) = bincode::decode_from_slice(&buffer, config::standard())
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    Ok(decoded)
}

/// All primes up to and including `limit`. (Sieve of Eratosthenes)
pub fn sieve_primes(limit: u32) -> Vec<u32> {
    let n = limit as usize;
    if n < 2 {
        return Vec::new();
    }

    let mut composite = vec![false; n + 1];
    let mut i = 2;
    while i * i <= n {
        if !composite[i] {
            for j in (i * i..=n).step_by(i) {
                composite[j] = true;
            }
        }
        i += 1;
    }

    (2..=n)
        .filter(|&i| !composite[i])
        .map(|i| i as u32)
        .collect()
}

/// The smallest prime in the (sorted) table that is strictly greater than `val`.
pub fn first_prime_above(primes: &[u32], val: usize) -> Option<u32> {
    let i = primes.partition_point(|&p| (p as usize) <= val);
    primes.get(i).copied()
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sieve_small() {
        assert_eq!(sieve_primes(1), Vec::<u32>::new());
        assert_eq!(sieve_primes(30), vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
    }

    #[test]
    fn prime_strictly_above() {
        let primes = sieve_primes(100);
        assert_eq!(first_prime_above(&primes, 0), Some(2));
        assert_eq!(first_prime_above(&primes, 7), Some(11));
        assert_eq!(first_prime_above(&primes, 8), Some(11));
        assert_eq!(first_prime_above(&primes, 97), None);
    }

    #[test]
    fn save_load_round_trip() {
        let path = std::env::temp_dir().join("specks_util_round_trip.bin");
        let data: Vec<u32> = vec![3, 1, 4, 1, 5];

        save(&path, &data).unwrap();
        let loaded: Vec<u32> = load(&path).unwrap();
        assert_eq!(loaded, data);

        let _ = std::fs::remove_file(&path);
    }
}
