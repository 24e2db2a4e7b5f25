use rand::{distributions::Alphanumeric, thread_rng, Rng};

pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Generates an opaque user id for this client, in the same shape the web
/// client used.
pub fn generate_user_id() -> String {
    format!("user_{}", random_string(9).to_lowercase())
}
