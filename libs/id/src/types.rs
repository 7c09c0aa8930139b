//! ID definitions for node agent resources.

use crate::define_id;

// =============================================================================
// Placement
// =============================================================================

define_id!(NodeId, "node", "node");
define_id!(FleetId, "fleet", "fleet");

// =============================================================================
// Machines
// =============================================================================

define_id!(MachineId, "mach", "machine");
define_id!(VersionId, "ver", "machine version");
define_id!(InstanceId, "inst", "instance");

// =============================================================================
// Events
// =============================================================================

define_id!(EventId, "evt", "event");
