//! Directory records decoded from cmdlet JSON output.
//!
//! Each record maps a fixed set of wire keys to typed fields. Keys outside
//! that set are kept, with their scalar or array shape, in an `extra` map
//! and exposed as [`CustomAttributes`]. `null` decodes to the field's empty
//! value.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::powershell::sanitize::CustomAttributes;

/// Treat `null` as the type's default.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The distinguished name of the container holding `dn`.
///
/// Commas escaped with a backslash are part of the leading RDN. Returns an
/// empty string when `dn` has a single component.
pub fn parent_dn(dn: &str) -> &str {
    let mut escaped = false;
    for (idx, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return dn[idx + 1..].trim_start(),
            _ => escaped = false,
        }
    }
    ""
}

macro_rules! custom_attributes_accessor {
    ($ty:ty) => {
        impl $ty {
            /// Attributes outside the fixed schema.
            pub fn custom_attributes(&self) -> CustomAttributes {
                CustomAttributes::from_json_map(&self.extra)
            }
        }
    };
}

/// Security identifier as emitted by the AD cmdlets (`{"Value": "S-1-..."}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sid {
    #[serde(rename = "Value", default, deserialize_with = "nullable")]
    pub value: String,
    /// `BinaryLength`, `AccountDomainSid` and anything else the host adds.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(Sid);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A user account (`Get-ADUser`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    #[serde(rename = "ObjectGUID", alias = "ObjectGuid", deserialize_with = "nullable")]
    pub guid: String,
    #[serde(rename = "SamAccountName", deserialize_with = "nullable")]
    pub sam_account_name: String,
    #[serde(rename = "UserPrincipalName", deserialize_with = "nullable")]
    pub principal_name: String,
    #[serde(rename = "DisplayName", deserialize_with = "nullable")]
    pub display_name: String,
    #[serde(rename = "DistinguishedName", deserialize_with = "nullable")]
    pub distinguished_name: String,
    #[serde(rename = "Enabled", deserialize_with = "nullable")]
    pub enabled: bool,
    #[serde(rename = "GivenName", deserialize_with = "nullable")]
    pub given_name: String,
    #[serde(rename = "Surname", deserialize_with = "nullable")]
    pub surname: String,
    #[serde(rename = "City", deserialize_with = "nullable")]
    pub city: String,
    #[serde(rename = "Company", deserialize_with = "nullable")]
    pub company: String,
    #[serde(rename = "Country", deserialize_with = "nullable")]
    pub country: String,
    #[serde(rename = "Department", deserialize_with = "nullable")]
    pub department: String,
    #[serde(rename = "Description", deserialize_with = "nullable")]
    pub description: String,
    #[serde(rename = "Division", deserialize_with = "nullable")]
    pub division: String,
    #[serde(rename = "EmailAddress", deserialize_with = "nullable")]
    pub email_address: String,
    #[serde(rename = "EmployeeID", deserialize_with = "nullable")]
    pub employee_id: String,
    #[serde(rename = "EmployeeNumber", deserialize_with = "nullable")]
    pub employee_number: String,
    #[serde(rename = "Fax", deserialize_with = "nullable")]
    pub fax: String,
    #[serde(rename = "HomeDirectory", deserialize_with = "nullable")]
    pub home_directory: String,
    #[serde(rename = "HomeDrive", deserialize_with = "nullable")]
    pub home_drive: String,
    #[serde(rename = "HomePhone", deserialize_with = "nullable")]
    pub home_phone: String,
    #[serde(rename = "HomePage", deserialize_with = "nullable")]
    pub home_page: String,
    #[serde(rename = "Initials", deserialize_with = "nullable")]
    pub initials: String,
    #[serde(rename = "MobilePhone", deserialize_with = "nullable")]
    pub mobile_phone: String,
    #[serde(rename = "Office", deserialize_with = "nullable")]
    pub office: String,
    #[serde(rename = "OfficePhone", deserialize_with = "nullable")]
    pub office_phone: String,
    #[serde(rename = "Organization", deserialize_with = "nullable")]
    pub organization: String,
    #[serde(rename = "OtherName", deserialize_with = "nullable")]
    pub other_name: String,
    #[serde(rename = "POBox", deserialize_with = "nullable")]
    pub po_box: String,
    #[serde(rename = "PostalCode", deserialize_with = "nullable")]
    pub postal_code: String,
    #[serde(rename = "State", deserialize_with = "nullable")]
    pub state: String,
    #[serde(rename = "StreetAddress", deserialize_with = "nullable")]
    pub street_address: String,
    #[serde(rename = "Title", deserialize_with = "nullable")]
    pub title: String,
    #[serde(rename = "userAccountControl", deserialize_with = "nullable")]
    pub user_account_control: i64,
    #[serde(rename = "SmartcardLogonRequired", deserialize_with = "nullable")]
    pub smartcard_logon_required: bool,
    #[serde(rename = "TrustedForDelegation", deserialize_with = "nullable")]
    pub trusted_for_delegation: bool,
    #[serde(rename = "PasswordNeverExpires", deserialize_with = "nullable")]
    pub password_never_expires: bool,
    #[serde(rename = "CannotChangePassword", deserialize_with = "nullable")]
    pub cannot_change_password: bool,
    #[serde(rename = "SID", deserialize_with = "nullable")]
    pub sid: Sid,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(User);

impl User {
    /// Distinguished name of the container holding the account.
    pub fn container(&self) -> &str {
        parent_dn(&self.distinguished_name)
    }
}

/// Group scope as the numeric `GroupScope` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupScope {
    DomainLocal = 0,
    Global = 1,
    Universal = 2,
}

impl GroupScope {
    pub fn from_num(num: i64) -> Option<Self> {
        match num {
            0 => Some(GroupScope::DomainLocal),
            1 => Some(GroupScope::Global),
            2 => Some(GroupScope::Universal),
            _ => None,
        }
    }

    /// The argument `New-ADGroup -GroupScope` accepts.
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupScope::DomainLocal => "DomainLocal",
            GroupScope::Global => "Global",
            GroupScope::Universal => "Universal",
        }
    }
}

impl FromStr for GroupScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domainlocal" => Ok(GroupScope::DomainLocal),
            "global" => Ok(GroupScope::Global),
            "universal" => Ok(GroupScope::Universal),
            other => Err(Error::Config(format!("Unknown group scope: {}", other))),
        }
    }
}

impl fmt::Display for GroupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group category as the numeric `GroupCategory` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupCategory {
    Distribution = 0,
    Security = 1,
}

impl GroupCategory {
    pub fn from_num(num: i64) -> Option<Self> {
        match num {
            0 => Some(GroupCategory::Distribution),
            1 => Some(GroupCategory::Security),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupCategory::Distribution => "Distribution",
            GroupCategory::Security => "Security",
        }
    }
}

impl FromStr for GroupCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "distribution" => Ok(GroupCategory::Distribution),
            "security" => Ok(GroupCategory::Security),
            other => Err(Error::Config(format!("Unknown group category: {}", other))),
        }
    }
}

impl fmt::Display for GroupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group (`Get-ADGroup`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    #[serde(rename = "ObjectGUID", alias = "ObjectGuid", deserialize_with = "nullable")]
    pub guid: String,
    #[serde(rename = "SamAccountName", deserialize_with = "nullable")]
    pub sam_account_name: String,
    #[serde(rename = "Name", deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "GroupScope", deserialize_with = "nullable")]
    pub scope_num: i64,
    #[serde(rename = "GroupCategory", deserialize_with = "nullable")]
    pub category_num: i64,
    #[serde(rename = "DistinguishedName", deserialize_with = "nullable")]
    pub distinguished_name: String,
    #[serde(rename = "Description", deserialize_with = "nullable")]
    pub description: String,
    #[serde(rename = "SID", deserialize_with = "nullable")]
    pub sid: Sid,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(Group);

impl Group {
    pub fn scope(&self) -> Option<GroupScope> {
        GroupScope::from_num(self.scope_num)
    }

    pub fn category(&self) -> Option<GroupCategory> {
        GroupCategory::from_num(self.category_num)
    }

    pub fn container(&self) -> &str {
        parent_dn(&self.distinguished_name)
    }
}

/// One member of a group (`Get-ADGroupMember`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMember {
    #[serde(rename = "ObjectGUID", alias = "ObjectGuid", deserialize_with = "nullable")]
    pub guid: String,
    #[serde(rename = "SamAccountName", deserialize_with = "nullable")]
    pub sam_account_name: String,
    #[serde(rename = "Name", deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "DistinguishedName", deserialize_with = "nullable")]
    pub distinguished_name: String,
    #[serde(rename = "objectClass", deserialize_with = "nullable")]
    pub object_class: String,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(GroupMember);

/// The members of one group, sorted by GUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMembership {
    pub group_id: String,
    pub members: Vec<GroupMember>,
}

impl GroupMembership {
    pub fn new(group_id: impl Into<String>, mut members: Vec<GroupMember>) -> Self {
        members.sort_by(|a, b| a.guid.cmp(&b.guid));
        Self {
            group_id: group_id.into(),
            members,
        }
    }

    /// Member GUIDs in sorted order.
    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.guid.as_str()).collect()
    }

    /// True when both hold the same members, ignoring order.
    pub fn same_members(&self, other: &Self) -> bool {
        self.member_ids() == other.member_ids()
    }
}

/// A computer account (`Get-ADComputer`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Computer {
    #[serde(rename = "ObjectGUID", alias = "ObjectGuid", deserialize_with = "nullable")]
    pub guid: String,
    #[serde(rename = "Name", deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "DistinguishedName", deserialize_with = "nullable")]
    pub dn: String,
    #[serde(rename = "Description", deserialize_with = "nullable")]
    pub description: String,
    #[serde(rename = "SamAccountName", deserialize_with = "nullable")]
    pub sam_account_name: String,
    #[serde(rename = "SID", deserialize_with = "nullable")]
    pub sid: Sid,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(Computer);

impl Computer {
    pub fn container(&self) -> &str {
        parent_dn(&self.dn)
    }
}

/// An organizational unit (`Get-ADOrganizationalUnit`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgUnit {
    #[serde(rename = "ObjectGUID", alias = "ObjectGuid", deserialize_with = "nullable")]
    pub guid: String,
    #[serde(rename = "Name", deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "Description", deserialize_with = "nullable")]
    pub description: String,
    #[serde(rename = "DistinguishedName", deserialize_with = "nullable")]
    pub distinguished_name: String,
    #[serde(rename = "ProtectedFromAccidentalDeletion", deserialize_with = "nullable")]
    pub protected: bool,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(OrgUnit);

impl OrgUnit {
    /// Distinguished name of the parent container.
    pub fn path(&self) -> &str {
        parent_dn(&self.distinguished_name)
    }
}

/// Numeric `GpoStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpoStatus {
    AllSettingsDisabled = 0,
    UserSettingsDisabled = 1,
    ComputerSettingsDisabled = 2,
    AllSettingsEnabled = 3,
}

impl GpoStatus {
    pub fn from_num(num: i64) -> Option<Self> {
        match num {
            0 => Some(GpoStatus::AllSettingsDisabled),
            1 => Some(GpoStatus::UserSettingsDisabled),
            2 => Some(GpoStatus::ComputerSettingsDisabled),
            3 => Some(GpoStatus::AllSettingsEnabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GpoStatus::AllSettingsDisabled => "AllSettingsDisabled",
            GpoStatus::UserSettingsDisabled => "UserSettingsDisabled",
            GpoStatus::ComputerSettingsDisabled => "ComputerSettingsDisabled",
            GpoStatus::AllSettingsEnabled => "AllSettingsEnabled",
        }
    }
}

impl fmt::Display for GpoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group policy object (`Get-GPO`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gpo {
    #[serde(rename = "Id", deserialize_with = "nullable")]
    pub id: String,
    #[serde(rename = "DisplayName", deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "DomainName", deserialize_with = "nullable")]
    pub domain: String,
    #[serde(rename = "Description", deserialize_with = "nullable")]
    pub description: String,
    #[serde(rename = "Owner", deserialize_with = "nullable")]
    pub owner: String,
    #[serde(rename = "GpoStatus", deserialize_with = "nullable")]
    pub status_num: i64,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(Gpo);

impl Gpo {
    pub fn status(&self) -> Option<GpoStatus> {
        GpoStatus::from_num(self.status_num)
    }
}

/// A link from a GPO to a container (`Get-GPInheritance` link entries).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpLink {
    #[serde(rename = "GpoId", deserialize_with = "nullable")]
    pub gpo_id: String,
    #[serde(rename = "DisplayName", deserialize_with = "nullable")]
    pub display_name: String,
    #[serde(rename = "Enabled", deserialize_with = "nullable")]
    pub enabled: bool,
    #[serde(rename = "Enforced", deserialize_with = "nullable")]
    pub enforced: bool,
    #[serde(rename = "Target", deserialize_with = "nullable")]
    pub target: String,
    #[serde(rename = "Order", deserialize_with = "nullable")]
    pub order: i64,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

custom_attributes_accessor!(GpLink);

impl GpLink {
    /// Composite identifier `<gpo guid>_<target dn>`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.gpo_id, self.target)
    }

    /// Split a composite identifier into GPO GUID and target DN.
    pub fn parse_id(id: &str) -> Option<(&str, &str)> {
        let (gpo, target) = id.split_once('_')?;
        if gpo.is_empty() || target.is_empty() {
            return None;
        }
        Some((gpo, target))
    }

    /// True when this link belongs to `gpo_id` (GUIDs compare case-insensitively).
    pub fn is_for(&self, gpo_id: &str) -> bool {
        self.gpo_id.eq_ignore_ascii_case(gpo_id.trim_matches(|c| c == '{' || c == '}'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powershell::sanitize::{AttributeValue, Scalar};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_user_decode() {
        let user: User = serde_json::from_str(
            r#"{
                "ObjectGUID": "12345678-1234-1234-1234-123456789012",
                "SamAccountName": "jdoe",
                "UserPrincipalName": "jdoe@example.com",
                "DistinguishedName": "CN=John Doe,OU=Users,DC=example,DC=com",
                "Enabled": true,
                "DisplayName": null,
                "userAccountControl": 512,
                "SID": {"Value": "S-1-5-21-1-2-3-1001"},
                "extensionAttribute1": "custom1",
                "extensionAttribute2": ["multi1", "multi2"]
            }"#,
        )
        .unwrap();

        assert_eq!(user.guid, "12345678-1234-1234-1234-123456789012");
        assert_eq!(user.principal_name, "jdoe@example.com");
        assert_eq!(user.display_name, "");
        assert!(user.enabled);
        assert_eq!(user.user_account_control, 512);
        assert_eq!(user.sid.value, "S-1-5-21-1-2-3-1001");
        assert_eq!(user.container(), "OU=Users,DC=example,DC=com");

        let custom = user.custom_attributes();
        assert_eq!(custom.len(), 2);
        assert_eq!(
            custom.get("extensionAttribute2"),
            Some(&AttributeValue::Multi(vec![Scalar::from("multi1"), Scalar::from("multi2")]))
        );
    }

    #[test]
    fn test_empty_object_decodes_to_defaults() {
        let user: User = serde_json::from_str("{}").unwrap();
        assert_eq!(user, User::default());
        let computer: Computer = serde_json::from_str("{}").unwrap();
        assert!(computer.name.is_empty());
    }

    #[test]
    fn test_guid_spellings() {
        let ou: OrgUnit = serde_json::from_str(
            r#"{"ObjectGuid": "ou-guid", "DistinguishedName": "OU=Eng,DC=example,DC=com", "ProtectedFromAccidentalDeletion": true}"#,
        )
        .unwrap();
        assert_eq!(ou.guid, "ou-guid");
        assert!(ou.protected);
        assert_eq!(ou.path(), "DC=example,DC=com");
        assert!(ou.extra.is_empty());
    }

    #[test]
    fn test_group_scope_and_category() {
        let group: Group = serde_json::from_str(r#"{"GroupScope": 2, "GroupCategory": 1}"#).unwrap();
        assert_eq!(group.scope_num, 2);
        assert_eq!(group.scope(), Some(GroupScope::Universal));
        assert_eq!(group.category(), Some(GroupCategory::Security));
        assert_eq!("global".parse::<GroupScope>().unwrap(), GroupScope::Global);
        assert!("bogus".parse::<GroupCategory>().is_err());
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let user = User {
            guid: "g".to_string(),
            sam_account_name: "s".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["ObjectGUID"], "g");
        assert_eq!(value["SamAccountName"], "s");
    }

    #[test]
    fn test_unknown_keys_survive_a_round_trip() {
        let sid: Sid =
            serde_json::from_str(r#"{"Value": "S-1-5-21-1", "BinaryLength": 28, "AccountDomainSid": null}"#).unwrap();
        assert_eq!(sid.to_string(), "S-1-5-21-1");
        let value = serde_json::to_value(&sid).unwrap();
        assert_eq!(value["BinaryLength"], 28);
        assert!(value.as_object().unwrap().contains_key("AccountDomainSid"));

        let member: GroupMember = serde_json::from_str(
            r#"{"ObjectGUID": "m", "objectClass": "user", "PropagatedFromGroup": ["Admins", "Ops"]}"#,
        )
        .unwrap();
        assert_eq!(
            member.custom_attributes().get("PropagatedFromGroup"),
            Some(&AttributeValue::Multi(vec![Scalar::from("Admins"), Scalar::from("Ops")]))
        );
        assert_eq!(serde_json::to_value(&member).unwrap()["PropagatedFromGroup"][1], "Ops");

        let link: GpLink =
            serde_json::from_str(r#"{"GpoId": "g", "Target": "OU=x,DC=example,DC=com", "GpoDomainName": "example.com"}"#)
                .unwrap();
        assert_eq!(link.custom_attributes().get("GpoDomainName"), Some(&AttributeValue::Single(Scalar::from("example.com"))));
        assert_eq!(serde_json::to_value(&link).unwrap()["GpoDomainName"], "example.com");
    }

    #[test]
    fn test_parent_dn_escaped_comma() {
        assert_eq!(parent_dn(r"CN=Doe\, John,OU=Users,DC=example,DC=com"), "OU=Users,DC=example,DC=com");
        assert_eq!(parent_dn("DC=com"), "");
    }

    #[test]
    fn test_membership_sorted() {
        let member = |guid: &str| GroupMember {
            guid: guid.to_string(),
            ..Default::default()
        };
        let a = GroupMembership::new("g", vec![member("b"), member("a")]);
        let b = GroupMembership::new("g", vec![member("a"), member("b")]);
        assert_eq!(a.member_ids(), vec!["a", "b"]);
        assert!(a.same_members(&b));
    }

    #[test]
    fn test_gplink_id() {
        let link: GpLink = serde_json::from_str(
            r#"{"GpoId": "31b2f340-016d-11d2-945f-00c04fb984f9", "Target": "OU=x,DC=example,DC=com", "Enabled": true, "Enforced": false, "Order": 2}"#,
        )
        .unwrap();
        let id = link.id();
        assert_eq!(
            GpLink::parse_id(&id),
            Some(("31b2f340-016d-11d2-945f-00c04fb984f9", "OU=x,DC=example,DC=com"))
        );
        assert!(link.is_for("{31B2F340-016D-11D2-945F-00C04FB984F9}"));
        assert_eq!(GpLink::parse_id("nounderscore"), None);
    }
}
