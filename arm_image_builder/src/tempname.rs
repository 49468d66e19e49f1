use rand::Rng;

pub const TEMP_NAME_ALPHABET: &str = "0123456789bcdfghjklmnpqrstvwxyz";
const SUFFIX_LENGTH: usize = 10;

/// Names of the temporary resources of one build, sharing a random suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempNames {
    pub suffix: String,
    pub resource_group: String,
    pub deployment: String,
    pub vm: String,
    pub public_ip: String,
}

impl TempNames {
    pub fn generate() -> Self {
        Self::with_suffix(&random_suffix())
    }

    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            resource_group: format!("packer-Resource-Group-{}", suffix),
            deployment: format!("pkrdp{}", suffix),
            vm: format!("pkrvm{}", suffix),
            public_ip: format!("pkrip{}", suffix),
        }
    }
}

fn random_suffix() -> String {
    let alphabet = TEMP_NAME_ALPHABET.as_bytes();
    let mut rng = rand::rng();
    (0..SUFFIX_LENGTH)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}
