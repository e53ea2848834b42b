// Default controller name for GatewayClasses handled by this controlplane.
pub const DEFAULT_CONTROLLER_NAME: &str = "gateway.networking.k8s.io/graph-controlplane";

// Default name of the GatewayClass this controlplane acts on.
pub const DEFAULT_GATEWAY_CLASS_NAME: &str = "graph";

// Field manager for status patches.
pub const FIELD_MANAGER: &str = "graph-controlplane-field-manager";

// Label set by Kubernetes on EndpointSlices to identify the owning Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

// API group of the Gateway API resources.
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

// Kind of the parent references routes attach through.
pub const GATEWAY_KIND: &str = "Gateway";

// The only route kind listeners accept.
pub const HTTP_ROUTE_KIND: &str = "HTTPRoute";

// The only backend kind routes may reference.
pub const SERVICE_KIND: &str = "Service";

// The only certificate reference kind HTTPS listeners may use.
pub const SECRET_KIND: &str = "Secret";

// Secret type required for listener certificates.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

// EndpointSlice address type the resolver accepts.
pub const ADDRESS_TYPE_IPV4: &str = "IPv4";

pub const PROTOCOL_HTTP: &str = "HTTP";
pub const PROTOCOL_HTTPS: &str = "HTTPS";
