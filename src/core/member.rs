//! Cluster membership: views, member records and the shared registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recovery status of one member as known locally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Offline,
    Recovering,
    Online,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Offline => "offline",
            MemberStatus::Recovering => "recovering",
            MemberStatus::Online => "online",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member as it appears in an installed view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewMember {
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
}

/// Immutable snapshot of group membership installed by the GCS layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct View {
    pub view_id: u64,
    pub members: Vec<ViewMember>,
    pub local: Uuid,
}

impl View {
    pub fn contains(&self, uuid: Uuid) -> bool {
        self.members.iter().any(|member| member.uuid == uuid)
    }
}

/// One member with its locally-known status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Member {
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
    pub status: MemberStatus,
}

#[derive(Default)]
struct RegistryInner {
    view_id: u64,
    members: BTreeMap<Uuid, Member>,
}

/// Cluster view membership and per-member status.
///
/// Replaced wholesale on view install; statuses survive across views for
/// members present in both. Read by recovery (donor selection), the
/// certifier (contribution counting) and the status record.
pub struct MemberRegistry {
    local: Uuid,
    inner: Mutex<RegistryInner>,
}

impl MemberRegistry {
    pub fn new(local: Uuid) -> Self {
        Self {
            local,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local
    }

    pub fn view_id(&self) -> u64 {
        self.lock().view_id
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    pub fn members(&self) -> Vec<Member> {
        self.lock().members.values().cloned().collect()
    }

    pub fn local_status(&self) -> MemberStatus {
        let inner = self.lock();
        inner
            .members
            .get(&self.local)
            .map(|member| member.status)
            .unwrap_or_default()
    }

    pub fn status_of(&self, uuid: Uuid) -> Option<MemberStatus> {
        self.lock().members.get(&uuid).map(|member| member.status)
    }

    pub fn set_status(&self, uuid: Uuid, status: MemberStatus) {
        let mut inner = self.lock();
        if let Some(member) = inner.members.get_mut(&uuid) {
            member.status = status;
        }
    }

    /// Installs a new view, keeping known statuses for surviving members.
    pub fn install_view(&self, view: &View) {
        let mut inner = self.lock();
        let mut members = BTreeMap::new();
        for entry in &view.members {
            let status = inner
                .members
                .get(&entry.uuid)
                .map(|member| member.status)
                .unwrap_or_default();
            members.insert(
                entry.uuid,
                Member {
                    uuid: entry.uuid,
                    host: entry.host.clone(),
                    port: entry.port,
                    status,
                },
            );
        }
        inner.view_id = view.view_id;
        inner.members = members;
    }

    /// Merges a member record learned from view-time data exchange.
    pub fn merge_exchanged(&self, member: Member) {
        let mut inner = self.lock();
        inner.members.insert(member.uuid, member);
    }

    /// First member that can serve as a donor: online, remote, not rejected.
    pub fn select_donor(&self, rejected: &[Uuid]) -> Option<Member> {
        let inner = self.lock();
        inner
            .members
            .values()
            .find(|member| {
                member.status == MemberStatus::Online
                    && member.uuid != self.local
                    && !rejected.contains(&member.uuid)
            })
            .cloned()
    }

    pub fn get(&self, uuid: Uuid) -> Option<Member> {
        self.lock().members.get(&uuid).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("member registry lock poisoned")
    }
}

/// Wire form of one member record for view-time data exchange.
///
/// Layout: uuid, status byte, port, host length, host bytes; little-endian.
pub(crate) fn encode_member(member: &Member) -> Vec<u8> {
    let mut out = Vec::with_capacity(23 + member.host.len());
    out.extend_from_slice(member.uuid.as_bytes());
    out.push(member.status as u8);
    out.extend_from_slice(&member.port.to_le_bytes());
    out.extend_from_slice(&(member.host.len() as u32).to_le_bytes());
    out.extend_from_slice(member.host.as_bytes());
    out
}

pub(crate) fn decode_member(data: &[u8]) -> Option<Member> {
    if data.len() < 23 {
        return None;
    }
    let uuid = Uuid::from_slice(&data[..16]).expect("sixteen bytes parse as a uuid");
    let status = match data[16] {
        0 => MemberStatus::Offline,
        1 => MemberStatus::Recovering,
        2 => MemberStatus::Online,
        _ => return None,
    };
    let port = u16::from_le_bytes(data[17..19].try_into().expect("length checked"));
    let host_len = u32::from_le_bytes(data[19..23].try_into().expect("length checked")) as usize;
    if data.len() < 23 + host_len {
        return None;
    }
    let host = String::from_utf8(data[23..23 + host_len].to_vec()).ok()?;
    Some(Member {
        uuid,
        host,
        port,
        status,
    })
}
