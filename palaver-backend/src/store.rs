use std::collections::HashMap;
use std::sync::RwLock;

use hmac::SimpleHmac;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use uuid::Uuid;

use palaver_core::auth::{
    PlainUser, PlainUserLookup, ScramUser, ScramUserLookup, UserLookupError,
};

struct StoredUser {
    password: String,
    scram: ScramUser,
}

/// In-memory credential store. The PBKDF2 derivation for every supported
/// hash happens once when the user is added, so SASL exchanges only do
/// cheap HMAC work.
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, StoredUser>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_user(&self, username: &str, password: &str, iterations: u32) {
        let salt = Uuid::new_v4().to_string().into_bytes();
        let mut scram = ScramUser::new(&Uuid::new_v4().to_string(), username, salt.clone(), iterations);

        let mut sha1_salted = [0u8; 20];
        pbkdf2::pbkdf2::<SimpleHmac<Sha1>>(
            password.as_bytes(),
            &salt,
            iterations,
            &mut sha1_salted,
        )
        .expect("pbkdf2 output length");
        scram.add_salted_password("SHA-1", sha1_salted.to_vec());

        let mut sha256_salted = [0u8; 32];
        pbkdf2::pbkdf2::<SimpleHmac<Sha256>>(
            password.as_bytes(),
            &salt,
            iterations,
            &mut sha256_salted,
        )
        .expect("pbkdf2 output length");
        scram.add_salted_password("SHA-256", sha256_salted.to_vec());

        let mut sha512_salted = [0u8; 64];
        pbkdf2::pbkdf2::<SimpleHmac<Sha512>>(
            password.as_bytes(),
            &salt,
            iterations,
            &mut sha512_salted,
        )
        .expect("pbkdf2 output length");
        scram.add_salted_password("SHA-512", sha512_salted.to_vec());

        self.users.write().expect("store lock poisoned").insert(
            username.to_string(),
            StoredUser {
                password: password.to_string(),
                scram,
            },
        );
    }

    pub fn remove_user(&self, username: &str) {
        self.users
            .write()
            .expect("store lock poisoned")
            .remove(username);
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainUserLookup for MemoryUserStore {
    fn user_by_username(&self, username: &str) -> Result<PlainUser, UserLookupError> {
        let users = self.users.read().expect("store lock poisoned");
        users
            .get(username)
            .map(|user| PlainUser {
                username: username.to_string(),
                password: user.password.clone(),
            })
            .ok_or(UserLookupError::NotFound)
    }
}

impl ScramUserLookup for MemoryUserStore {
    fn user_by_username(&self, username: &str) -> Result<ScramUser, UserLookupError> {
        let users = self.users.read().expect("store lock poisoned");
        users
            .get(username)
            .map(|user| user.scram.clone())
            .ok_or(UserLookupError::NotFound)
    }
}
