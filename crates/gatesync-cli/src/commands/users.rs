use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use gatesync_core::models::{NewUser, UserPatch, UserStatus, UserType};
use gatesync_core::sync::ImportSummary;
use gatesync_core::GateNode;

use crate::commands::common::{find_user, format_user_lines, open_node};
use crate::error::CliError;

pub fn run_users_add(
    rfid_tag: &str,
    name: Option<String>,
    nic: Option<String>,
    user_type: UserType,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let user = node.recorder().create_user(NewUser {
        rfid_tag: rfid_tag.to_string(),
        name,
        nic,
        user_type,
    })?;
    println!("Enrolled user {} ({})", user.id, user.rfid_tag);
    Ok(())
}

/// Enrol every row of a CSV file on `node`.
pub fn import_file(node: &GateNode, file: &Path) -> Result<ImportSummary, CliError> {
    let reader = BufReader::new(File::open(file)?);
    Ok(node.recorder().import_users(reader)?)
}

pub fn run_users_import(file: &Path, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let summary = import_file(&node, file)?;
    println!(
        "Imported {} users ({} duplicates, {} invalid rows skipped)",
        summary.inserted, summary.duplicates, summary.invalid
    );
    Ok(())
}

pub fn run_users_list(limit: usize, as_json: bool, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let users = node.users(limit, 0)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }
    if users.is_empty() {
        println!("No users enrolled.");
    }
    for line in format_user_lines(&users) {
        println!("{line}");
    }
    Ok(())
}

pub fn build_patch(
    name: Option<String>,
    status: Option<UserStatus>,
    user_type: Option<UserType>,
    active: Option<bool>,
) -> Result<UserPatch, CliError> {
    let patch = UserPatch {
        name,
        status,
        user_type,
        is_active: active,
        ..UserPatch::default()
    };
    if patch.is_empty() {
        return Err(CliError::EmptyUpdate);
    }
    Ok(patch)
}

pub fn run_users_set(key: &str, patch: &UserPatch, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let user = find_user(&node, key)?;
    let updated = node.recorder().update_user(user.id, patch)?;
    for line in format_user_lines(std::slice::from_ref(&updated)) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_users_delete(key: &str, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let user = find_user(&node, key)?;
    node.recorder().delete_user(user.id)?;
    println!("Deleted user {} ({})", user.id, user.rfid_tag);
    Ok(())
}
