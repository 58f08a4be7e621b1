/*!
 * @file authentication.rs
 * @brief SCRAM credential storage, server-side conversations and roles
 */

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::config::UserConfig;
use crate::cursor_registry::UserId;
use crate::error::CommandError;

const SHA1_ITERATIONS: u32 = 10_000;
const SHA256_ITERATIONS: u32 = 15_000;
const SERVER_NONCE_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramMechanism {
    Sha1,
    Sha256,
}

impl ScramMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScramMechanism::Sha1 => "SCRAM-SHA-1",
            ScramMechanism::Sha256 => "SCRAM-SHA-256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA-1" => Some(ScramMechanism::Sha1),
            "SCRAM-SHA-256" => Some(ScramMechanism::Sha256),
            _ => None,
        }
    }

    fn key_len(&self) -> usize {
        match self {
            ScramMechanism::Sha1 => 20,
            ScramMechanism::Sha256 => 32,
        }
    }
}

fn hmac_bytes(mechanism: ScramMechanism, key: &[u8], data: &[u8]) -> Vec<u8> {
    match mechanism {
        ScramMechanism::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramMechanism::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn hash_bytes(mechanism: ScramMechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        ScramMechanism::Sha1 => Sha1::digest(data).to_vec(),
        ScramMechanism::Sha256 => Sha256::digest(data).to_vec(),
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a ^ b).collect()
}

/// A SCRAM verifier as stored per (db, user, mechanism): the server never
/// keeps the clear-text password.
#[derive(Debug, Clone)]
pub struct ScramCredential {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramCredential {
    pub fn derive(mechanism: ScramMechanism, username: &str, password: &str) -> Self {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let (iterations, salted) = match mechanism {
            ScramMechanism::Sha1 => {
                // SCRAM-SHA-1 salts the MD5 digest of "user:mongo:password".
                let hashed = format!(
                    "{:x}",
                    md5::compute(format!("{}:mongo:{}", username, password))
                );
                let mut out = vec![0u8; mechanism.key_len()];
                pbkdf2::pbkdf2_hmac::<Sha1>(
                    hashed.as_bytes(),
                    &salt,
                    SHA1_ITERATIONS,
                    &mut out,
                );
                (SHA1_ITERATIONS, out)
            }
            ScramMechanism::Sha256 => {
                let mut out = vec![0u8; mechanism.key_len()];
                pbkdf2::pbkdf2_hmac::<Sha256>(
                    password.as_bytes(),
                    &salt,
                    SHA256_ITERATIONS,
                    &mut out,
                );
                (SHA256_ITERATIONS, out)
            }
        };

        let client_key = hmac_bytes(mechanism, &salted, b"Client Key");
        let stored_key = hash_bytes(mechanism, &client_key);
        let server_key = hmac_bytes(mechanism, &salted, b"Server Key");
        Self {
            iterations,
            salt,
            stored_key,
            server_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    ReadWrite,
    DbAdmin,
    DbOwner,
    ClusterAdmin,
    Root,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "read" => Some(Role::Read),
            "readWrite" => Some(Role::ReadWrite),
            "dbAdmin" => Some(Role::DbAdmin),
            "dbOwner" => Some(Role::DbOwner),
            "clusterAdmin" => Some(Role::ClusterAdmin),
            "root" => Some(Role::Root),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::ReadWrite => "readWrite",
            Role::DbAdmin => "dbAdmin",
            Role::DbOwner => "dbOwner",
            Role::ClusterAdmin => "clusterAdmin",
            Role::Root => "root",
        }
    }
}

/// What a command needs from its caller. Checked at dispatch, before any
/// argument parsing side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Handshake/auth/meta traffic allowed before authentication.
    Always,
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub db: String,
    pub name: String,
    pub roles: Vec<Role>,
    credentials: HashMap<ScramMechanism, ScramCredential>,
}

impl StoredUser {
    fn grants(&self, target_db: &str, kind: CommandKind) -> bool {
        // Roles granted on admin reach every database.
        if self.db != "admin" && self.db != target_db {
            return false;
        }
        self.roles.iter().any(|role| match kind {
            CommandKind::Always => true,
            CommandKind::Read => matches!(
                role,
                Role::Read | Role::ReadWrite | Role::DbOwner | Role::ClusterAdmin | Role::Root
            ),
            CommandKind::Write => matches!(role, Role::ReadWrite | Role::DbOwner | Role::Root),
            CommandKind::Admin => matches!(
                role,
                Role::DbAdmin | Role::DbOwner | Role::ClusterAdmin | Role::Root
            ),
        })
    }

    pub fn is_cluster_admin(&self) -> bool {
        self.db == "admin"
            && self
                .roles
                .iter()
                .any(|r| matches!(r, Role::ClusterAdmin | Role::Root))
    }
}

pub struct UserStore {
    users: RwLock<HashMap<UserId, StoredUser>>,
}

impl Default for UserStore {
    fn default() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl UserStore {
    pub fn from_config(users: &[UserConfig]) -> Result<Self, CommandError> {
        let store = Self::default();
        for user in users {
            let roles: Result<Vec<Role>, CommandError> = user
                .roles
                .iter()
                .map(|r| {
                    Role::from_name(r).ok_or_else(|| {
                        CommandError::bad_value(format!("No role named {}@{}", r, user.db))
                    })
                })
                .collect();
            store.create_user(&user.db, &user.name, &user.password, roles?);
        }
        Ok(store)
    }

    pub fn create_user(&self, db: &str, name: &str, password: &str, roles: Vec<Role>) {
        let mut credentials = HashMap::new();
        credentials.insert(
            ScramMechanism::Sha1,
            ScramCredential::derive(ScramMechanism::Sha1, name, password),
        );
        credentials.insert(
            ScramMechanism::Sha256,
            ScramCredential::derive(ScramMechanism::Sha256, name, password),
        );
        let user = StoredUser {
            db: db.to_string(),
            name: name.to_string(),
            roles,
            credentials,
        };
        self.users
            .write()
            .insert((db.to_string(), name.to_string()), user);
    }

    pub fn get(&self, db: &str, name: &str) -> Option<StoredUser> {
        self.users
            .read()
            .get(&(db.to_string(), name.to_string()))
            .cloned()
    }

    fn credential(
        &self,
        db: &str,
        name: &str,
        mechanism: ScramMechanism,
    ) -> Option<ScramCredential> {
        self.get(db, name)
            .and_then(|u| u.credentials.get(&mechanism).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Role check at command entry. `user` is the connection's authenticated
    /// identity; `None` with auth enabled only passes `Always` commands.
    pub fn authorize(
        &self,
        auth_enabled: bool,
        user: Option<&UserId>,
        target_db: &str,
        kind: CommandKind,
        command: &str,
    ) -> Result<(), CommandError> {
        if !auth_enabled || kind == CommandKind::Always {
            return Ok(());
        }
        let Some((db, name)) = user else {
            return Err(CommandError::unauthorized(format!(
                "command {} requires authentication",
                command
            )));
        };
        let Some(stored) = self.get(db, name) else {
            return Err(CommandError::unauthorized(format!(
                "not authorized on {} to execute command {}",
                target_db, command
            )));
        };
        if stored.grants(target_db, kind) {
            Ok(())
        } else {
            Err(CommandError::unauthorized(format!(
                "not authorized on {} to execute command {}",
                target_db, command
            )))
        }
    }
}

#[derive(Debug)]
enum ConversationState {
    AwaitingProof,
    AwaitingFinal,
    Done,
}

/// One in-flight SCRAM exchange, owned by the connection between saslStart
/// and the final saslContinue.
#[derive(Debug)]
pub struct ScramConversation {
    pub mechanism: ScramMechanism,
    pub db: String,
    pub username: String,
    credential: ScramCredential,
    nonce: String,
    client_first_bare: String,
    server_first: String,
    state: ConversationState,
}

impl ScramConversation {
    /// Handles `saslStart`; returns the conversation and the server-first
    /// payload (nonce, salt, iteration count).
    pub fn start(
        store: &UserStore,
        db: &str,
        mechanism: ScramMechanism,
        payload: &[u8],
    ) -> Result<(Self, Vec<u8>), CommandError> {
        let client_first = std::str::from_utf8(payload)
            .map_err(|_| CommandError::authentication_failed())?;

        // gs2 header: no channel binding supported or required.
        let bare = client_first
            .strip_prefix("n,,")
            .or_else(|| client_first.strip_prefix("y,,"))
            .ok_or_else(CommandError::authentication_failed)?;

        let attrs = parse_attributes(bare)?;
        let username = attrs
            .get(&'n')
            .map(|u| u.replace("=2C", ",").replace("=3D", "="))
            .ok_or_else(CommandError::authentication_failed)?;
        let client_nonce = attrs
            .get(&'r')
            .ok_or_else(CommandError::authentication_failed)?;

        let credential = store
            .credential(db, &username, mechanism)
            .ok_or_else(CommandError::authentication_failed)?;

        let mut server_bytes = vec![0u8; SERVER_NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut server_bytes);
        let nonce = format!("{}{}", client_nonce, BASE64.encode(server_bytes));

        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            BASE64.encode(&credential.salt),
            credential.iterations
        );

        let conversation = Self {
            mechanism,
            db: db.to_string(),
            username,
            credential,
            nonce,
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            state: ConversationState::AwaitingProof,
        };
        Ok((conversation, server_first.into_bytes()))
    }

    /// Handles `saslContinue`. The proof leg answers with the server
    /// signature; the empty final leg completes the exchange.
    pub fn continue_with(&mut self, payload: &[u8]) -> Result<(Vec<u8>, bool), CommandError> {
        match self.state {
            ConversationState::AwaitingProof => {
                let client_final = std::str::from_utf8(payload)
                    .map_err(|_| CommandError::authentication_failed())?;
                let attrs = parse_attributes(client_final)?;

                let channel = attrs
                    .get(&'c')
                    .ok_or_else(CommandError::authentication_failed)?;
                if channel != "biws" {
                    return Err(CommandError::authentication_failed());
                }
                let nonce = attrs
                    .get(&'r')
                    .ok_or_else(CommandError::authentication_failed)?;
                if *nonce != self.nonce {
                    return Err(CommandError::authentication_failed());
                }
                let proof = attrs
                    .get(&'p')
                    .ok_or_else(CommandError::authentication_failed)?;
                let proof = BASE64
                    .decode(proof)
                    .map_err(|_| CommandError::authentication_failed())?;

                let without_proof = client_final
                    .rsplit_once(",p=")
                    .map(|(head, _)| head)
                    .ok_or_else(CommandError::authentication_failed)?;
                let auth_message = format!(
                    "{},{},{}",
                    self.client_first_bare, self.server_first, without_proof
                );

                let client_signature = hmac_bytes(
                    self.mechanism,
                    &self.credential.stored_key,
                    auth_message.as_bytes(),
                );
                if proof.len() != client_signature.len() {
                    return Err(CommandError::authentication_failed());
                }
                let client_key = xor(&proof, &client_signature);
                if hash_bytes(self.mechanism, &client_key) != self.credential.stored_key {
                    return Err(CommandError::authentication_failed());
                }

                let server_signature = hmac_bytes(
                    self.mechanism,
                    &self.credential.server_key,
                    auth_message.as_bytes(),
                );
                self.state = ConversationState::AwaitingFinal;
                Ok((
                    format!("v={}", BASE64.encode(server_signature)).into_bytes(),
                    false,
                ))
            }
            ConversationState::AwaitingFinal => {
                self.state = ConversationState::Done;
                Ok((Vec::new(), true))
            }
            ConversationState::Done => Err(CommandError::authentication_failed()),
        }
    }

    /// True once the proof has been verified; the connection may set its
    /// authenticated user at this point.
    pub fn verified(&self) -> bool {
        matches!(
            self.state,
            ConversationState::AwaitingFinal | ConversationState::Done
        )
    }
}

fn parse_attributes(message: &str) -> Result<HashMap<char, String>, CommandError> {
    let mut out = HashMap::new();
    for part in message.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let mut chars = key.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            out.insert(c, value.to_string());
        }
    }
    Ok(out)
}
